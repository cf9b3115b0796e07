//! Dispatch boundary and lifecycle state machine.
//!
//! Modules are registered with a [`ModuleRegistry`] and instantiated into
//! type-erased [`VtabHandle`]s. Every module callback runs through one
//! boundary that catches panics, records the failure in the table's error
//! slot, and logs it. The handle tracks table, transaction, and cursor
//! state and rejects out-of-order calls with `Misuse` instead of passing
//! them to the module.
//!
//! # Type Erasure
//!
//! A concrete `VirtualTable` is stored as `Box<dyn ErasedTable>` and its
//! cursors as `Box<dyn ErasedCursor>`, following the same adapter shape as
//! the function registry: blanket impls forward each erased call to the
//! typed trait.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::{Cx, SqlValue};

use crate::config::DispatchConfig;
use crate::function::{FindFunction, FunctionOp};
use crate::index::{BestIndexOutcome, ColumnMask, IndexInfo, IndexPlan};
use crate::module::{
    Capabilities, ColumnContext, Module, VirtualTable, VirtualTableCursor, VtabConfigFlags,
    VtabContext,
};
use crate::savepoint::SavepointStack;
use crate::schema::TableSchema;
use crate::update::{RowKey, UpdateOp};

/// A table instance shared between the registry and its users.
pub type SharedVtab = Arc<Mutex<VtabHandle>>;

/// Lifecycle of a table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Connected,
    Disconnected,
    Destroyed,
}

/// Two-phase-commit position of a table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Begun,
    Synced,
}

/// Position of a cursor. `Closed` is represented by the handle being
/// consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Opened; not usable until the first `filter`.
    Opened,
    Iterating,
    /// Latched until the next `filter`.
    AtEnd,
}

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

/// Last error message of a table, shared with its cursors.
#[derive(Debug, Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<String>>>);

impl ErrorSlot {
    fn set(&self, msg: String) {
        *self.0.lock() = Some(msg);
    }

    fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "module panicked".to_owned())
}

/// Run one module callback.
fn boundary<R>(
    config: &DispatchConfig,
    slot: &ErrorSlot,
    table: &str,
    op: &'static str,
    f: impl FnOnce() -> Result<R>,
) -> Result<R> {
    let result = if config.catch_panics {
        panic::catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|payload| Err(BridgeError::Panic(panic_message(payload.as_ref()))))
    } else {
        f()
    };
    if let Err(err) = &result {
        debug!(table, op, error = %err, "virtual table callback failed");
        slot.set(err.to_string());
    }
    result
}

// ---------------------------------------------------------------------------
// Erased adapters
// ---------------------------------------------------------------------------

trait ErasedCursor: Send {
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()>;
    fn next(&mut self, cx: &Cx) -> Result<()>;
    fn eof(&self) -> bool;
    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()>;
    fn rowid(&self) -> Result<i64>;
    fn close_boxed(self: Box<Self>, cx: &Cx) -> Result<()>;
}

impl<C: VirtualTableCursor> ErasedCursor for C {
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()> {
        <C as VirtualTableCursor>::filter(self, cx, idx_num, idx_str, args)
    }

    fn next(&mut self, cx: &Cx) -> Result<()> {
        <C as VirtualTableCursor>::next(self, cx)
    }

    fn eof(&self) -> bool {
        <C as VirtualTableCursor>::eof(self)
    }

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
        <C as VirtualTableCursor>::column(self, ctx, col)
    }

    fn rowid(&self) -> Result<i64> {
        <C as VirtualTableCursor>::rowid(self)
    }

    fn close_boxed(self: Box<Self>, cx: &Cx) -> Result<()> {
        <C as VirtualTableCursor>::close(*self, cx)
    }
}

trait ErasedTable: Send + Sync {
    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome>;
    fn open(&self) -> Result<Box<dyn ErasedCursor>>;
    fn disconnect(&mut self, cx: &Cx) -> Result<()>;
    fn destroy(&mut self, cx: &Cx) -> Result<()>;
    fn update(&mut self, cx: &Cx, op: UpdateOp) -> Result<Option<i64>>;
    fn begin(&mut self, cx: &Cx) -> Result<()>;
    fn sync(&mut self, cx: &Cx) -> Result<()>;
    fn commit(&mut self, cx: &Cx) -> Result<()>;
    fn rollback(&mut self, cx: &Cx) -> Result<()>;
    fn find_function(&self, n_arg: i32, name: &str) -> FindFunction;
    fn rename(&mut self, cx: &Cx, new_name: &str) -> Result<()>;
    fn savepoint(&mut self, cx: &Cx, id: i32) -> Result<()>;
    fn release(&mut self, cx: &Cx, id: i32) -> Result<()>;
    fn rollback_to(&mut self, cx: &Cx, id: i32) -> Result<()>;
}

impl<T> ErasedTable for T
where
    T: VirtualTable,
    T::Cursor: 'static,
{
    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome> {
        <T as VirtualTable>::best_index(self, info)
    }

    fn open(&self) -> Result<Box<dyn ErasedCursor>> {
        Ok(Box::new(<T as VirtualTable>::open(self)?))
    }

    fn disconnect(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::disconnect(self, cx)
    }

    fn destroy(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::destroy(self, cx)
    }

    fn update(&mut self, cx: &Cx, op: UpdateOp) -> Result<Option<i64>> {
        <T as VirtualTable>::update(self, cx, op)
    }

    fn begin(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::begin(self, cx)
    }

    fn sync(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::sync(self, cx)
    }

    fn commit(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::commit(self, cx)
    }

    fn rollback(&mut self, cx: &Cx) -> Result<()> {
        <T as VirtualTable>::rollback(self, cx)
    }

    fn find_function(&self, n_arg: i32, name: &str) -> FindFunction {
        <T as VirtualTable>::find_function(self, n_arg, name)
    }

    fn rename(&mut self, cx: &Cx, new_name: &str) -> Result<()> {
        <T as VirtualTable>::rename(self, cx, new_name)
    }

    fn savepoint(&mut self, cx: &Cx, id: i32) -> Result<()> {
        <T as VirtualTable>::savepoint(self, cx, id)
    }

    fn release(&mut self, cx: &Cx, id: i32) -> Result<()> {
        <T as VirtualTable>::release(self, cx, id)
    }

    fn rollback_to(&mut self, cx: &Cx, id: i32) -> Result<()> {
        <T as VirtualTable>::rollback_to(self, cx, id)
    }
}

trait ErasedModule: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    fn construct(
        &self,
        cx: &Cx,
        ctx: &mut VtabContext,
        args: &[&str],
        create: bool,
    ) -> Result<Box<dyn ErasedTable>>;
}

struct ModuleEntry<T: VirtualTable> {
    module: Module<T>,
    aux: T::Aux,
}

impl<T> ErasedModule for ModuleEntry<T>
where
    T: VirtualTable + 'static,
    T::Cursor: 'static,
{
    fn capabilities(&self) -> Capabilities {
        self.module.capabilities()
    }

    fn construct(
        &self,
        cx: &Cx,
        ctx: &mut VtabContext,
        args: &[&str],
        create: bool,
    ) -> Result<Box<dyn ErasedTable>> {
        let table = if create {
            T::create(cx, ctx, &self.aux, args)?
        } else {
            T::connect(cx, ctx, &self.aux, args)?
        };
        Ok(Box::new(table))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Public view of a registered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub capabilities: Capabilities,
}

struct Registered {
    name: String,
    module: Arc<dyn ErasedModule>,
}

/// Modules registered by name, plus the lazily created eponymous
/// instances.
///
/// Lookup is case-insensitive.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Registered>>,
    eponymous: Mutex<HashMap<String, SharedVtab>>,
    config: Arc<DispatchConfig>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ModuleRegistry")
            .field("modules", &names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    #[must_use]
    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            eponymous: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Register `module` under `name`. A name can be registered once.
    pub fn register<T>(&self, name: &str, module: Module<T>, aux: T::Aux) -> Result<()>
    where
        T: VirtualTable + 'static,
        T::Cursor: 'static,
    {
        let key = name.to_ascii_lowercase();
        let mut modules = self.modules.write();
        if modules.contains_key(&key) {
            return Err(BridgeError::misuse(format!(
                "module {name} is already registered"
            )));
        }
        info!(
            module = name,
            capabilities = ?module.capabilities(),
            "registered virtual table module"
        );
        modules.insert(
            key,
            Registered {
                name: name.to_owned(),
                module: Arc::new(ModuleEntry { module, aux }),
            },
        );
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<ModuleInfo> {
        self.modules
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|r| ModuleInfo {
                name: r.name.clone(),
                capabilities: r.module.capabilities(),
            })
    }

    /// Registered module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().values().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Result<(String, Arc<dyn ErasedModule>)> {
        self.modules
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|r| (r.name.clone(), Arc::clone(&r.module)))
            .ok_or_else(|| BridgeError::NoSuchModule {
                name: name.to_owned(),
            })
    }

    /// `CREATE VIRTUAL TABLE table_name USING module(args)`.
    pub fn create_table(
        &self,
        cx: &Cx,
        module: &str,
        table_name: &str,
        args: &[&str],
    ) -> Result<VtabHandle> {
        self.explicit(cx, module, table_name, args, true)
    }

    /// Re-attach to a table created earlier.
    pub fn connect_table(
        &self,
        cx: &Cx,
        module: &str,
        table_name: &str,
        args: &[&str],
    ) -> Result<VtabHandle> {
        self.explicit(cx, module, table_name, args, false)
    }

    fn explicit(
        &self,
        cx: &Cx,
        module: &str,
        table_name: &str,
        args: &[&str],
        create: bool,
    ) -> Result<VtabHandle> {
        let (name, entry) = self.lookup(module)?;
        if !entry.capabilities().contains(Capabilities::CREATE) {
            return Err(BridgeError::message(format!(
                "module {name} is eponymous-only and cannot back table {table_name}"
            )));
        }
        self.instantiate(cx, &name, entry.as_ref(), table_name, args, create)
    }

    /// The implicit table named after `module`, connected on first use.
    pub fn eponymous(&self, cx: &Cx, module: &str) -> Result<SharedVtab> {
        let (name, entry) = self.lookup(module)?;
        if !entry.capabilities().contains(Capabilities::EPONYMOUS) {
            return Err(BridgeError::message(format!(
                "module {name} is not eponymous"
            )));
        }
        let key = name.to_ascii_lowercase();
        let mut tables = self.eponymous.lock();
        if let Some(existing) = tables.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let handle = self
            .instantiate(cx, &name, entry.as_ref(), &name, &[], false)?
            .into_shared();
        tables.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Disconnect every eponymous instance. Failures are logged and the
    /// first one is returned.
    pub fn shutdown(&self, cx: &Cx) -> Result<()> {
        let tables: Vec<SharedVtab> = self.eponymous.lock().drain().map(|(_, t)| t).collect();
        let mut first_err = None;
        for table in tables {
            let mut handle = table.lock();
            if handle.state() != TableState::Connected {
                continue;
            }
            if let Err(err) = handle.disconnect(cx) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn instantiate(
        &self,
        cx: &Cx,
        module_name: &str,
        entry: &dyn ErasedModule,
        table_name: &str,
        args: &[&str],
        create: bool,
    ) -> Result<VtabHandle> {
        let op = if create { "create" } else { "connect" };
        let error = ErrorSlot::default();
        let mut ctx = VtabContext::new(module_name, table_name);
        let built = boundary(&self.config, &error, table_name, op, || {
            entry.construct(cx, &mut ctx, args, create)
        });
        let (schema, config_flags, message) = ctx.into_parts();

        let mut table = match built {
            Ok(table) => table,
            Err(err) => {
                warn!(module = module_name, table = table_name, op, error = %err, "virtual table constructor failed");
                return Err(match (err, message) {
                    (BridgeError::Error(_), Some(msg)) => BridgeError::Error(msg),
                    (err, _) => err,
                });
            }
        };

        let Some(schema) = schema else {
            // The instance exists, so it still gets its disconnect.
            if let Err(err) = boundary(&self.config, &error, table_name, "disconnect", || {
                table.disconnect(cx)
            }) {
                warn!(module = module_name, table = table_name, error = %err, "disconnect after missing schema failed");
            }
            return Err(BridgeError::misuse(format!(
                "module {module_name} did not declare a schema for {table_name}"
            )));
        };

        let capabilities = entry.capabilities();
        info!(
            module = module_name,
            table = table_name,
            op,
            columns = schema.len(),
            "virtual table connected"
        );
        Ok(VtabHandle {
            module_name: module_name.to_owned(),
            table_name: table_name.to_owned(),
            capabilities,
            table,
            state: TableState::Connected,
            txn: TxnState::Idle,
            savepoints: SavepointStack::new(),
            open_cursors: Arc::new(AtomicUsize::new(0)),
            error,
            schema,
            config_flags,
            function_ops: Vec::new(),
            config: Arc::clone(&self.config),
        })
    }
}

// ---------------------------------------------------------------------------
// Table handle
// ---------------------------------------------------------------------------

/// An operator overload recorded from `find_function`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredOperator {
    pub name: String,
    pub n_arg: i32,
    pub op: FunctionOp,
}

/// A connected table instance behind the dispatch boundary.
pub struct VtabHandle {
    module_name: String,
    table_name: String,
    capabilities: Capabilities,
    table: Box<dyn ErasedTable>,
    state: TableState,
    txn: TxnState,
    savepoints: SavepointStack<()>,
    open_cursors: Arc<AtomicUsize>,
    error: ErrorSlot,
    schema: TableSchema,
    config_flags: VtabConfigFlags,
    function_ops: Vec<RegisteredOperator>,
    config: Arc<DispatchConfig>,
}

impl fmt::Debug for VtabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VtabHandle")
            .field("module", &self.module_name)
            .field("table", &self.table_name)
            .field("state", &self.state)
            .field("txn", &self.txn)
            .field("open_cursors", &self.open_cursor_count())
            .finish_non_exhaustive()
    }
}

impl VtabHandle {
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub const fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub const fn state(&self) -> TableState {
        self.state
    }

    pub const fn txn_state(&self) -> TxnState {
        self.txn
    }

    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub const fn config_flags(&self) -> VtabConfigFlags {
        self.config_flags
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state == TableState::Connected
    }

    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.load(Ordering::Acquire)
    }

    /// Message of the most recent failed call on this table or its cursors.
    pub fn last_error(&self) -> Option<String> {
        self.error.get()
    }

    pub fn clear_error(&self) {
        self.error.clear();
    }

    /// Savepoint ids recorded in the current transaction.
    pub fn savepoint_ids(&self) -> Vec<i32> {
        self.savepoints.ids()
    }

    pub fn function_operators(&self) -> &[RegisteredOperator] {
        &self.function_ops
    }

    /// Operator code registered for `name` with `n_arg` arguments.
    pub fn function_operator(&self, name: &str, n_arg: i32) -> Option<FunctionOp> {
        self.function_ops
            .iter()
            .find(|r| r.n_arg == n_arg && r.name.eq_ignore_ascii_case(name))
            .map(|r| r.op)
    }

    pub fn into_shared(self) -> SharedVtab {
        Arc::new(Mutex::new(self))
    }

    fn fail<R>(&self, err: BridgeError) -> Result<R> {
        self.error.set(err.to_string());
        Err(err)
    }

    fn ensure_connected(&self, op: &str) -> Result<()> {
        if self.state == TableState::Connected {
            return Ok(());
        }
        self.fail(BridgeError::misuse(format!(
            "{op} on {:?} table {}",
            self.state, self.table_name
        )))
    }

    /// `Ok(true)` to proceed. A violation is `Misuse` in strict mode and a
    /// logged no-op (`Ok(false)`) otherwise.
    fn check_order(&self, ok: bool, detail: impl FnOnce() -> String) -> Result<bool> {
        if ok {
            return Ok(true);
        }
        let detail = detail();
        if self.config.strict_protocol {
            return self.fail(BridgeError::misuse(detail));
        }
        warn!(table = %self.table_name, detail, "protocol violation skipped");
        Ok(false)
    }

    fn call<R>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut (dyn ErasedTable + 'static)) -> Result<R>,
    ) -> Result<R> {
        let table = &mut *self.table;
        boundary(&self.config, &self.error, &self.table_name, op, move || f(table))
    }

    fn call_ref<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&(dyn ErasedTable + 'static)) -> Result<R>,
    ) -> Result<R> {
        let table = &*self.table;
        boundary(&self.config, &self.error, &self.table_name, op, move || f(table))
    }

    // -- planning and scanning --

    /// Ask the module for a strategy. Accepted answers are validated.
    pub fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome> {
        self.ensure_connected("best_index")?;
        let outcome = self.call_ref("best_index", |t| t.best_index(info))?;
        if outcome == BestIndexOutcome::Accept {
            if let Err(err) = info.validate() {
                return self.fail(err);
            }
        }
        debug!(
            table = %self.table_name,
            ?outcome,
            idx_num = info.idx_num,
            estimated_cost = info.estimated_cost,
            estimated_rows = info.estimated_rows,
            "best_index"
        );
        Ok(outcome)
    }

    pub fn open(&self) -> Result<CursorHandle> {
        self.ensure_connected("open")?;
        let cursor = self.call_ref("open", |t| t.open())?;
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
        Ok(CursorHandle {
            cursor: Some(cursor),
            state: CursorState::Opened,
            table_name: self.table_name.clone(),
            open_cursors: Arc::clone(&self.open_cursors),
            error: self.error.clone(),
            config: Arc::clone(&self.config),
        })
    }

    // -- mutation --

    /// Decode an engine argument vector and apply it.
    pub fn update(
        &mut self,
        cx: &Cx,
        args: &[SqlValue],
        unchanged: ColumnMask,
    ) -> Result<Option<i64>> {
        self.ensure_connected("update")?;
        if !self.capabilities.contains(Capabilities::UPDATE) {
            return self.fail(BridgeError::ReadOnly);
        }
        let op = match UpdateOp::decode_for(&self.schema, args, unchanged) {
            Ok(op) => op,
            Err(err) => return self.fail(err),
        };
        self.update_op(cx, op)
    }

    pub fn update_op(&mut self, cx: &Cx, op: UpdateOp) -> Result<Option<i64>> {
        self.ensure_connected("update")?;
        if !self.capabilities.contains(Capabilities::UPDATE) {
            return self.fail(BridgeError::ReadOnly);
        }
        let kind = op.kind();
        let rowid = self.call("update", |t| t.update(cx, op))?;
        debug!(table = %self.table_name, kind, ?rowid, "update");
        Ok(rowid)
    }

    // -- transactions --

    pub fn begin(&mut self, cx: &Cx) -> Result<()> {
        self.ensure_connected("begin")?;
        if !self.check_order(self.txn == TxnState::Idle, || {
            format!("begin on {} while a transaction is open", self.table_name)
        })? {
            return Ok(());
        }
        if self.capabilities.contains(Capabilities::TRANSACTIONS) {
            self.call("begin", |t| t.begin(cx))?;
        }
        self.txn = TxnState::Begun;
        debug!(table = %self.table_name, "begin");
        Ok(())
    }

    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.ensure_connected("sync")?;
        if !self.check_order(self.txn == TxnState::Begun, || {
            format!("sync on {} in state {:?}", self.table_name, self.txn)
        })? {
            return Ok(());
        }
        if self.capabilities.contains(Capabilities::TRANSACTIONS) {
            self.call("sync", |t| t.sync(cx))?;
        }
        self.txn = TxnState::Synced;
        debug!(table = %self.table_name, "sync");
        Ok(())
    }

    /// Ends the transaction whether or not the module's commit succeeds.
    pub fn commit(&mut self, cx: &Cx) -> Result<()> {
        self.finish(cx, "commit")
    }

    /// Ends the transaction whether or not the module's rollback succeeds.
    pub fn rollback(&mut self, cx: &Cx) -> Result<()> {
        self.finish(cx, "rollback")
    }

    fn finish(&mut self, cx: &Cx, op: &'static str) -> Result<()> {
        self.ensure_connected(op)?;
        if !self.check_order(self.txn != TxnState::Idle, || {
            format!("{op} on {} outside a transaction", self.table_name)
        })? {
            return Ok(());
        }
        let result = if self.capabilities.contains(Capabilities::TRANSACTIONS) {
            self.call(op, |t| {
                if op == "commit" {
                    t.commit(cx)
                } else {
                    t.rollback(cx)
                }
            })
        } else {
            Ok(())
        };
        self.txn = TxnState::Idle;
        self.savepoints.clear();
        debug!(table = %self.table_name, op, ok = result.is_ok(), "transaction finished");
        result
    }

    pub fn savepoint(&mut self, cx: &Cx, id: i32) -> Result<()> {
        if !self.savepoint_allowed("savepoint")? {
            return Ok(());
        }
        if self.capabilities.contains(Capabilities::SAVEPOINTS) {
            self.call("savepoint", |t| t.savepoint(cx, id))?;
        }
        self.savepoints.savepoint(id, ());
        debug!(table = %self.table_name, id, "savepoint");
        Ok(())
    }

    pub fn release(&mut self, cx: &Cx, id: i32) -> Result<()> {
        if !self.savepoint_allowed("release")? {
            return Ok(());
        }
        if self.capabilities.contains(Capabilities::SAVEPOINTS) {
            self.call("release", |t| t.release(cx, id))?;
        }
        self.savepoints.release(id);
        debug!(table = %self.table_name, id, "release");
        Ok(())
    }

    pub fn rollback_to(&mut self, cx: &Cx, id: i32) -> Result<()> {
        if !self.savepoint_allowed("rollback_to")? {
            return Ok(());
        }
        if self.capabilities.contains(Capabilities::SAVEPOINTS) {
            self.call("rollback_to", |t| t.rollback_to(cx, id))?;
        }
        self.savepoints.rollback_to(id);
        debug!(table = %self.table_name, id, "rollback_to");
        Ok(())
    }

    fn savepoint_allowed(&self, op: &str) -> Result<bool> {
        self.ensure_connected(op)?;
        self.check_order(self.txn == TxnState::Begun, || {
            format!("{op} on {} outside an open transaction", self.table_name)
        })
    }

    // -- functions and rename --

    /// Ask for a function override. Operator overloads are recorded so the
    /// planner can offer them as constraints later.
    pub fn find_function(&mut self, n_arg: i32, name: &str) -> Result<FindFunction> {
        self.ensure_connected("find_function")?;
        if !self.capabilities.contains(Capabilities::FIND_FUNCTION) {
            return Ok(FindFunction::NotOverloaded);
        }
        let found = self.call_ref("find_function", |t| Ok(t.find_function(n_arg, name)))?;
        if let Some(op) = found.operator() {
            self.function_ops
                .retain(|r| !(r.n_arg == n_arg && r.name.eq_ignore_ascii_case(name)));
            self.function_ops.push(RegisteredOperator {
                name: name.to_owned(),
                n_arg,
                op,
            });
        }
        debug!(table = %self.table_name, name, n_arg, ?found, "find_function");
        Ok(found)
    }

    pub fn rename(&mut self, cx: &Cx, new_name: &str) -> Result<()> {
        self.ensure_connected("rename")?;
        if !self.capabilities.contains(Capabilities::RENAME) {
            return self.fail(BridgeError::message(format!(
                "virtual table {} does not support rename",
                self.table_name
            )));
        }
        self.call("rename", |t| t.rename(cx, new_name))?;
        info!(from = %self.table_name, to = new_name, "virtual table renamed");
        new_name.clone_into(&mut self.table_name);
        Ok(())
    }

    // -- teardown --

    /// Release the instance; backing storage persists.
    pub fn disconnect(&mut self, cx: &Cx) -> Result<()> {
        self.teardown(cx, false)
    }

    /// Release the instance and its backing storage.
    pub fn destroy(&mut self, cx: &Cx) -> Result<()> {
        self.teardown(cx, true)
    }

    fn teardown(&mut self, cx: &Cx, destroy: bool) -> Result<()> {
        let op = if destroy { "destroy" } else { "disconnect" };
        self.ensure_connected(op)?;
        let open = self.open_cursor_count();
        if open > 0 {
            return self.fail(BridgeError::misuse(format!(
                "{op} on {} with {open} open cursor(s)",
                self.table_name
            )));
        }
        if self.txn != TxnState::Idle {
            warn!(table = %self.table_name, op, "rolling back open transaction before teardown");
            if let Err(err) = self.rollback(cx) {
                warn!(table = %self.table_name, op, error = %err, "rollback before teardown failed");
            }
        }
        let result = self.call(op, |t| if destroy { t.destroy(cx) } else { t.disconnect(cx) });
        // Released whatever the module answered; it is never called again.
        self.state = if destroy {
            TableState::Destroyed
        } else {
            TableState::Disconnected
        };
        match result {
            Ok(()) => {
                info!(table = %self.table_name, op, "virtual table released");
                Ok(())
            }
            Err(err) => {
                warn!(table = %self.table_name, op, error = %err, "virtual table teardown failed");
                Err(err)
            }
        }
    }
}

impl Drop for VtabHandle {
    fn drop(&mut self) {
        if self.state != TableState::Connected {
            return;
        }
        let cx = Cx::new();
        let open = self.open_cursor_count();
        if open > 0 {
            warn!(table = %self.table_name, open, "dropping table handle with open cursors");
        }
        if let Err(err) = self.call("disconnect", |t| t.disconnect(&cx)) {
            warn!(table = %self.table_name, error = %err, "disconnect on drop failed");
        }
        self.state = TableState::Disconnected;
    }
}

// ---------------------------------------------------------------------------
// Cursor handle
// ---------------------------------------------------------------------------

/// An open cursor behind the dispatch boundary.
///
/// Closing consumes the handle. Dropping it without `close` still closes the
/// module cursor, logging any failure.
pub struct CursorHandle {
    cursor: Option<Box<dyn ErasedCursor>>,
    state: CursorState,
    table_name: String,
    open_cursors: Arc<AtomicUsize>,
    error: ErrorSlot,
    config: Arc<DispatchConfig>,
}

impl fmt::Debug for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorHandle")
            .field("table", &self.table_name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CursorHandle {
    pub const fn state(&self) -> CursorState {
        self.state
    }

    fn cursor(&self) -> Result<&dyn ErasedCursor> {
        self.cursor
            .as_deref()
            .ok_or_else(|| BridgeError::misuse("cursor already closed"))
    }

    fn misuse<R>(&self, detail: String) -> Result<R> {
        let err = BridgeError::misuse(detail);
        self.error.set(err.to_string());
        Err(err)
    }

    fn require_row(&self, op: &str) -> Result<()> {
        match self.state {
            CursorState::Iterating => Ok(()),
            CursorState::Opened => {
                self.misuse(format!("{op} before filter on {}", self.table_name))
            }
            CursorState::AtEnd => {
                self.misuse(format!("{op} at end of data on {}", self.table_name))
            }
        }
    }

    /// Start or restart a scan.
    pub fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()> {
        let Some(cursor) = self.cursor.as_deref_mut() else {
            return Err(BridgeError::misuse("filter on closed cursor"));
        };
        let result = boundary(&self.config, &self.error, &self.table_name, "filter", || {
            cursor.filter(cx, idx_num, idx_str, args)?;
            Ok(cursor.eof())
        });
        match result {
            Ok(eof) => {
                self.state = if eof {
                    CursorState::AtEnd
                } else {
                    CursorState::Iterating
                };
                debug!(table = %self.table_name, idx_num, args = args.len(), eof, "filter");
                Ok(())
            }
            Err(err) => {
                self.state = CursorState::Opened;
                Err(err)
            }
        }
    }

    /// [`filter`](Self::filter) with a probed plan.
    pub fn filter_plan(&mut self, cx: &Cx, plan: &IndexPlan, args: &[SqlValue]) -> Result<()> {
        self.filter(cx, plan.idx_num, plan.idx_str.as_deref(), args)
    }

    /// Advance one row. At end of data this is a no-op.
    pub fn next(&mut self, cx: &Cx) -> Result<()> {
        match self.state {
            CursorState::Opened => {
                return self.misuse(format!("next before filter on {}", self.table_name));
            }
            CursorState::AtEnd => return Ok(()),
            CursorState::Iterating => {}
        }
        let Some(cursor) = self.cursor.as_deref_mut() else {
            return Err(BridgeError::misuse("next on closed cursor"));
        };
        let eof = boundary(&self.config, &self.error, &self.table_name, "next", || {
            cursor.next(cx)?;
            Ok(cursor.eof())
        })?;
        if eof {
            self.state = CursorState::AtEnd;
        }
        Ok(())
    }

    pub fn eof(&self) -> Result<bool> {
        match self.state {
            CursorState::Opened => {
                self.misuse(format!("eof before filter on {}", self.table_name))
            }
            CursorState::Iterating => Ok(false),
            CursorState::AtEnd => Ok(true),
        }
    }

    /// Value of column `col` of the current row; unset means NULL.
    pub fn column(&self, col: i32) -> Result<SqlValue> {
        self.require_row("column")?;
        let cursor = self.cursor()?;
        let mut ctx = ColumnContext::new();
        boundary(&self.config, &self.error, &self.table_name, "column", || {
            cursor.column(&mut ctx, col)
        })?;
        Ok(ctx.take_value().unwrap_or(SqlValue::Null))
    }

    /// Read for an UPDATE. `None` means the module left an unchanged column
    /// unset, so the column keeps its value.
    pub fn column_for_update(&self, col: i32, changed: bool) -> Result<Option<SqlValue>> {
        self.require_row("column")?;
        let cursor = self.cursor()?;
        let mut ctx = if changed {
            ColumnContext::new()
        } else {
            ColumnContext::unchanged()
        };
        boundary(&self.config, &self.error, &self.table_name, "column", || {
            cursor.column(&mut ctx, col)
        })?;
        Ok(match ctx.take_value() {
            Some(value) => Some(value),
            None if !changed => None,
            None => Some(SqlValue::Null),
        })
    }

    pub fn rowid(&self) -> Result<i64> {
        self.require_row("rowid")?;
        let cursor = self.cursor()?;
        boundary(&self.config, &self.error, &self.table_name, "rowid", || {
            cursor.rowid()
        })
    }

    /// Read `columns` from every remaining row.
    pub fn collect_rows(&mut self, cx: &Cx, columns: &[i32]) -> Result<Vec<Vec<SqlValue>>> {
        let mut rows = Vec::new();
        while !self.eof()? {
            let row = columns
                .iter()
                .map(|&c| self.column(c))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
            self.next(cx)?;
        }
        Ok(rows)
    }

    /// Close the cursor. The handle is consumed even if the module fails.
    pub fn close(mut self, cx: &Cx) -> Result<()> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(());
        };
        let result = boundary(&self.config, &self.error, &self.table_name, "close", || {
            cursor.close_boxed(cx)
        });
        debug!(table = %self.table_name, ok = result.is_ok(), "cursor closed");
        result
    }
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            let cx = Cx::new();
            if let Err(err) = boundary(&self.config, &self.error, &self.table_name, "close", || {
                cursor.close_boxed(&cx)
            }) {
                warn!(table = %self.table_name, error = %err, "close on drop failed");
            }
        }
        self.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }
}
