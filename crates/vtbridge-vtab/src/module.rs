//! Virtual table and cursor traits.
//!
//! Virtual tables expose external data sources as SQL tables. These traits
//! are **open** (user-implementable): extension authors implement them and
//! register the type with a [`ModuleRegistry`](crate::ModuleRegistry)
//! through a [`Module`] capability set.
//!
//! # Cx on effectful methods
//!
//! Methods that may block or mutate accept `&Cx` so they can poll the
//! statement interrupt. Lightweight accessors (`eof`, `column`, `rowid`)
//! read already-fetched row data and do not.

use std::marker::PhantomData;

use bitflags::bitflags;
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::{Cx, SqlValue};

use crate::function::FindFunction;
use crate::index::{BestIndexOutcome, IndexInfo};
use crate::schema::TableSchema;
use crate::update::UpdateOp;

// ---------------------------------------------------------------------------
// Creation context
// ---------------------------------------------------------------------------

/// Per-table options a module may set while it is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtabConfig {
    /// The module honours ON CONFLICT for constraint failures in `update`.
    ConstraintSupport(bool),
    /// Safe to use from triggers and views in untrusted schemas.
    Innocuous,
    /// Only usable from top-level SQL.
    DirectOnly,
    /// The module reads every attached schema.
    UsesAllSchemas,
}

bitflags! {
    /// Accumulated [`VtabConfig`] settings.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct VtabConfigFlags: u32 {
        const CONSTRAINT_SUPPORT = 1 << 0;
        const INNOCUOUS = 1 << 1;
        const DIRECT_ONLY = 1 << 2;
        const USES_ALL_SCHEMAS = 1 << 3;
    }
}

/// Handed to `create` / `connect`. The module declares its schema here,
/// exactly once.
#[derive(Debug)]
pub struct VtabContext {
    module_name: String,
    table_name: String,
    schema: Option<TableSchema>,
    flags: VtabConfigFlags,
    error: Option<String>,
}

impl VtabContext {
    pub fn new(module_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            table_name: table_name.into(),
            schema: None,
            flags: VtabConfigFlags::empty(),
            error: None,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Name the table is being created under.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Declare the table's columns with a `CREATE TABLE` statement.
    ///
    /// A second call is `Misuse`; a malformed declaration is `Schema`.
    pub fn declare_schema(&mut self, sql: &str) -> Result<()> {
        if self.schema.is_some() {
            return Err(BridgeError::misuse(format!(
                "schema for {} declared twice",
                self.table_name
            )));
        }
        self.schema = Some(TableSchema::parse(sql)?);
        Ok(())
    }

    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    pub fn config(&mut self, option: VtabConfig) {
        match option {
            VtabConfig::ConstraintSupport(on) => {
                self.flags.set(VtabConfigFlags::CONSTRAINT_SUPPORT, on);
            }
            VtabConfig::Innocuous => self.flags |= VtabConfigFlags::INNOCUOUS,
            VtabConfig::DirectOnly => self.flags |= VtabConfigFlags::DIRECT_ONLY,
            VtabConfig::UsesAllSchemas => self.flags |= VtabConfigFlags::USES_ALL_SCHEMAS,
        }
    }

    pub const fn config_flags(&self) -> VtabConfigFlags {
        self.flags
    }

    /// Attach a message that replaces the text of a generic failure.
    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error = Some(msg.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Option<TableSchema>, VtabConfigFlags, Option<String>) {
        (self.schema, self.flags, self.error)
    }
}

// ---------------------------------------------------------------------------
// Column context
// ---------------------------------------------------------------------------

/// Receives one column value from [`VirtualTableCursor::column`].
///
/// Leaving it unset means NULL. During the row read that precedes an
/// UPDATE, [`is_nochange`](Self::is_nochange) reports whether the statement
/// leaves this column alone; a module may then skip producing it.
#[derive(Debug, Default)]
pub struct ColumnContext {
    value: Option<SqlValue>,
    nochange: bool,
}

impl ColumnContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context for the pre-UPDATE read of a column the statement does not
    /// assign.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            value: None,
            nochange: true,
        }
    }

    pub fn set_value(&mut self, val: SqlValue) {
        self.value = Some(val);
    }

    /// Take the value out, leaving `None`.
    pub fn take_value(&mut self) -> Option<SqlValue> {
        self.value.take()
    }

    pub const fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub const fn is_nochange(&self) -> bool {
        self.nochange
    }
}

// ---------------------------------------------------------------------------
// VirtualTable trait
// ---------------------------------------------------------------------------

/// A virtual table module.
///
/// At minimum implement `connect`, `best_index`, and `open`. The `Sized`
/// bound on the constructors keeps the rest of the trait object-safe.
///
/// Optional hooks only run when the matching capability is enabled on the
/// [`Module`] the type is registered with; otherwise the dispatcher treats
/// them as unsupported.
#[allow(clippy::missing_errors_doc)]
pub trait VirtualTable: Send + Sync {
    /// The cursor type for scanning this virtual table.
    type Cursor: VirtualTableCursor;

    /// Client data registered alongside the module.
    type Aux: Send + Sync;

    /// `CREATE VIRTUAL TABLE`: may initialise backing storage. Defaults to
    /// `connect`.
    fn create(cx: &Cx, ctx: &mut VtabContext, aux: &Self::Aux, args: &[&str]) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(cx, ctx, aux, args)
    }

    /// Attach to existing backing storage.
    fn connect(cx: &Cx, ctx: &mut VtabContext, aux: &Self::Aux, args: &[&str]) -> Result<Self>
    where
        Self: Sized;

    /// Choose an access strategy for one candidate plan. Must only look at
    /// constraints flagged usable, and must not keep `info` past the call.
    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome>;

    /// Open a new scan cursor. Any number may be open at once.
    fn open(&self) -> Result<Self::Cursor>;

    /// Release in-memory state; backing storage persists.
    fn disconnect(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    /// `DROP TABLE`: release state and backing storage. Defaults to
    /// `disconnect`.
    fn destroy(&mut self, cx: &Cx) -> Result<()> {
        self.disconnect(cx)
    }

    /// INSERT / UPDATE / DELETE. Returns the new rowid for an insert into a
    /// rowid table.
    ///
    /// Cursors may be open while this runs; the module must either keep
    /// them valid or fail.
    fn update(&mut self, _cx: &Cx, _op: UpdateOp) -> Result<Option<i64>> {
        Err(BridgeError::ReadOnly)
    }

    fn begin(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    /// Phase one of two-phase commit.
    fn sync(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    /// Offer an override for function `name` called with `n_arg` arguments.
    fn find_function(&self, _n_arg: i32, _name: &str) -> FindFunction {
        FindFunction::NotOverloaded
    }

    /// Returning an error blocks the rename.
    fn rename(&mut self, _cx: &Cx, _new_name: &str) -> Result<()> {
        Err(BridgeError::Unsupported)
    }

    fn savepoint(&mut self, _cx: &Cx, _id: i32) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _cx: &Cx, _id: i32) -> Result<()> {
        Ok(())
    }

    fn rollback_to(&mut self, _cx: &Cx, _id: i32) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VirtualTableCursor trait
// ---------------------------------------------------------------------------

/// A cursor for scanning a virtual table.
///
/// Cursors are `Send` but not `Sync`: each is a single-threaded scan bound
/// to its latest `filter`.
///
/// # Lifecycle
///
/// 1. [`filter`](Self::filter) starts (or restarts) a scan.
/// 2. Check [`eof`](Self::eof), read [`column`](Self::column) /
///    [`rowid`](Self::rowid), advance with [`next`](Self::next).
/// 3. [`close`](Self::close) consumes the cursor.
#[allow(clippy::missing_errors_doc)]
pub trait VirtualTableCursor: Send {
    /// Begin a scan with the strategy chosen by `best_index`.
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()>;

    fn next(&mut self, cx: &Cx) -> Result<()>;

    /// No current row.
    fn eof(&self) -> bool;

    /// Write column `col` (hidden columns counted) of the current row.
    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()>;

    fn rowid(&self) -> Result<i64>;

    fn close(self, _cx: &Cx) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Module capability set
// ---------------------------------------------------------------------------

bitflags! {
    /// Which optional parts of the protocol a module implements.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Explicit `CREATE VIRTUAL TABLE` is allowed.
        const CREATE = 1 << 0;
        /// Usable implicitly under the module's own name.
        const EPONYMOUS = 1 << 1;
        const UPDATE = 1 << 2;
        const TRANSACTIONS = 1 << 3;
        const SAVEPOINTS = 1 << 4;
        const RENAME = 1 << 5;
        const FIND_FUNCTION = 1 << 6;
    }
}

/// A virtual table type plus the capabilities it is registered with.
///
/// `Module::new()` is eponymous-only: no explicit creation, read-only, no
/// transaction hooks.
///
/// ```ignore
/// let module = Module::<MemTable>::new()
///     .with_create()
///     .with_update()
///     .with_transactions();
/// ```
pub struct Module<T> {
    capabilities: Capabilities,
    _table: PhantomData<fn() -> T>,
}

impl<T> Clone for Module<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Module<T> {}

impl<T> std::fmt::Debug for Module<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl<T: VirtualTable> Default for Module<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: VirtualTable> Module<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capabilities: Capabilities::EPONYMOUS,
            _table: PhantomData,
        }
    }

    /// Allow `CREATE VIRTUAL TABLE`. The module stops being eponymous
    /// unless [`eponymous`](Self::eponymous) is also called.
    #[must_use]
    pub const fn with_create(mut self) -> Self {
        self.capabilities = self
            .capabilities
            .union(Capabilities::CREATE)
            .difference(Capabilities::EPONYMOUS);
        self
    }

    /// Usable both implicitly and through `CREATE VIRTUAL TABLE`; create
    /// needs no backing-store initialisation.
    #[must_use]
    pub const fn eponymous(mut self) -> Self {
        self.capabilities = self
            .capabilities
            .union(Capabilities::CREATE)
            .union(Capabilities::EPONYMOUS);
        self
    }

    #[must_use]
    pub const fn with_update(mut self) -> Self {
        self.capabilities = self.capabilities.union(Capabilities::UPDATE);
        self
    }

    #[must_use]
    pub const fn with_transactions(mut self) -> Self {
        self.capabilities = self.capabilities.union(Capabilities::TRANSACTIONS);
        self
    }

    #[must_use]
    pub const fn with_savepoints(mut self) -> Self {
        self.capabilities = self.capabilities.union(Capabilities::SAVEPOINTS);
        self
    }

    #[must_use]
    pub const fn with_rename(mut self) -> Self {
        self.capabilities = self.capabilities.union(Capabilities::RENAME);
        self
    }

    #[must_use]
    pub const fn with_find_function(mut self) -> Self {
        self.capabilities = self.capabilities.union(Capabilities::FIND_FUNCTION);
        self
    }

    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub const fn is_eponymous_only(&self) -> bool {
        !self.capabilities.contains(Capabilities::CREATE)
    }
}
