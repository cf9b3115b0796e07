//! In-memory writable virtual table (`memtable`).
//!
//! ```sql
//! CREATE VIRTUAL TABLE people USING memtable(
//!     id INTEGER PRIMARY KEY, name TEXT NOT NULL, note TEXT HIDDEN, strict=1
//! );
//! ```
//!
//! Arguments of the form `key=value` are [`MemTableOptions`]; the rest are
//! column definitions. Rows live in a [`MemCatalog`] keyed by table name, so
//! a later `connect` re-attaches to the same data, `destroy` drops it, and
//! `rename` moves it.
//!
//! An `INTEGER PRIMARY KEY` column is the rowid: inserting `id = 10` stores
//! the row under rowid 10, and an auto-assigned rowid is written back into
//! the column. With `without_rowid=1` the table is declared `WITHOUT ROWID`
//! and rows are addressed by their PRIMARY KEY value; the map key is then an
//! internal slot that never leaves the table.
//!
//! The row map is copy-on-write (`Arc<BTreeMap<rowid, row>>`). A cursor pins
//! the map it saw at `filter`, a transaction pins the map it saw at `begin`,
//! and each savepoint pins its own; a write clones the map only while
//! someone still holds the old one.
//!
//! The table overloads `prefix(column, text)` as a constraint operator so
//! the predicate can be pushed into the scan.

pub mod options;
pub mod plan;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use vtbridge_error::{BridgeError, ConstraintKind, Result};
use vtbridge_types::{Cx, SqlValue};
use vtbridge_vtab::index::FUNCTION_OP_MIN;
use vtbridge_vtab::{
    BestIndexOutcome, ColumnContext, ColumnMask, ConstraintOp, FindFunction, FunctionOp,
    IndexInfo, Module, ModuleRegistry, RowKey, SavepointStack, ScalarFunction, TableSchema,
    UpdateOp, VirtualTable, VirtualTableCursor, VtabConfig, VtabContext,
};

pub use options::MemTableOptions;
pub use plan::{Access, Edge, ScanPlan};

#[must_use]
pub const fn extension_name() -> &'static str {
    "memtable"
}

/// Name the module is registered under.
pub const MEMTABLE: &str = "memtable";

/// Operator code `prefix(col, text)` is overloaded as.
pub const PREFIX_OP: u8 = FUNCTION_OP_MIN;

/// Register `memtable` with every optional capability, backed by `catalog`.
pub fn register(registry: &ModuleRegistry, catalog: MemCatalog) -> Result<()> {
    let module = Module::<MemTable>::new()
        .with_create()
        .with_update()
        .with_transactions()
        .with_savepoints()
        .with_rename()
        .with_find_function();
    registry.register(MEMTABLE, module, catalog)
}

pub type Row = Vec<SqlValue>;

/// One version of a table's rows.
pub type Rows = Arc<BTreeMap<i64, Row>>;

type SharedRows = Arc<Mutex<Rows>>;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Backing stores of every memtable, keyed by lower-case table name.
///
/// Clones share the same catalog.
#[derive(Clone, Default)]
pub struct MemCatalog {
    tables: Arc<Mutex<HashMap<String, SharedRows>>>,
}

impl fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemCatalog")
            .field("tables", &self.table_names())
            .finish()
    }
}

impl MemCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.lock().contains_key(&table.to_ascii_lowercase())
    }

    /// The current committed-or-not rows of `table`.
    pub fn rows(&self, table: &str) -> Option<Rows> {
        self.tables
            .lock()
            .get(&table.to_ascii_lowercase())
            .map(|store| Arc::clone(&*store.lock()))
    }

    fn attach(&self, table: &str, create: bool) -> Result<SharedRows> {
        let key = table.to_ascii_lowercase();
        let mut tables = self.tables.lock();
        let existing = tables.get(&key).map(Arc::clone);
        match (existing, create) {
            (Some(_), true) => Err(BridgeError::TableExists {
                name: table.to_owned(),
            }),
            (Some(store), false) => Ok(store),
            (None, true) => {
                let store = SharedRows::default();
                tables.insert(key, Arc::clone(&store));
                Ok(store)
            }
            (None, false) => Err(BridgeError::NoSuchTable {
                name: table.to_owned(),
            }),
        }
    }

    fn drop_table(&self, table: &str) -> bool {
        self.tables.lock().remove(&table.to_ascii_lowercase()).is_some()
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (from_key, to_key) = (from.to_ascii_lowercase(), to.to_ascii_lowercase());
        let mut tables = self.tables.lock();
        if from_key != to_key && tables.contains_key(&to_key) {
            return Err(BridgeError::TableExists { name: to.to_owned() });
        }
        let store = tables
            .remove(&from_key)
            .ok_or_else(|| BridgeError::NoSuchTable {
                name: from.to_owned(),
            })?;
        tables.insert(to_key, store);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// prefix() overload
// ---------------------------------------------------------------------------

/// `prefix(text, p)`: 1 if `text` starts with `p`, NULL if either is NULL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixFunction;

impl PrefixFunction {
    pub fn matches(value: &SqlValue, prefix: &SqlValue) -> Option<bool> {
        if value.is_null() || prefix.is_null() {
            return None;
        }
        Some(value.to_text().starts_with(&prefix.to_text()))
    }
}

impl ScalarFunction for PrefixFunction {
    fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
        let [value, prefix] = args else {
            return Err(BridgeError::message(format!(
                "wrong number of arguments to function prefix(): {}",
                args.len()
            )));
        };
        Ok(Self::matches(value, prefix).map_or(SqlValue::Null, |m| SqlValue::Integer(i64::from(m))))
    }

    fn num_args(&self) -> i32 {
        2
    }

    fn name(&self) -> &str {
        "prefix"
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// One connection to a memtable.
pub struct MemTable {
    name: String,
    catalog: MemCatalog,
    store: SharedRows,
    schema: TableSchema,
    options: MemTableOptions,
    txn: Option<Rows>,
    savepoints: SavepointStack<Rows>,
}

impl MemTable {
    fn attach(
        ctx: &mut VtabContext,
        catalog: &MemCatalog,
        args: &[&str],
        create: bool,
    ) -> Result<Self> {
        let (options, columns) = MemTableOptions::parse(args)?;
        if columns.is_empty() {
            return Err(BridgeError::schema("memtable: no columns declared"));
        }
        let trailer = if options.without_rowid { " WITHOUT ROWID" } else { "" };
        ctx.declare_schema(&format!("CREATE TABLE x({}){trailer}", columns.join(", ")))?;
        let schema = ctx
            .schema()
            .cloned()
            .ok_or_else(|| BridgeError::internal("memtable: schema missing after declare"))?;
        ctx.config(VtabConfig::ConstraintSupport(true));

        let name = ctx.table_name().to_owned();
        let store = catalog.attach(&name, create)?;
        info!(
            table = %name,
            create,
            columns = schema.len(),
            read_only = options.read_only,
            strict = options.strict,
            without_rowid = options.without_rowid,
            "memtable: attached"
        );
        Ok(Self {
            name,
            catalog: catalog.clone(),
            store,
            schema,
            options,
            txn: None,
            savepoints: SavepointStack::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn options(&self) -> &MemTableOptions {
        &self.options
    }

    fn qualified(&self, col: usize) -> String {
        let column = self.schema.column(col).map_or("?", |c| c.name.as_str());
        format!("{}.{column}", self.name)
    }

    /// Coerce and check one candidate row. `exclude` is the rowid the row
    /// replaces, which does not count as a duplicate.
    fn check_row(&self, rows: &BTreeMap<i64, Row>, values: Row, exclude: Option<i64>) -> Result<Row> {
        if values.len() != self.schema.len() {
            return Err(BridgeError::misuse(format!(
                "memtable {}: expected {} values, got {}",
                self.name,
                self.schema.len(),
                values.len()
            )));
        }
        let mut row = Vec::with_capacity(values.len());
        for (i, (col, value)) in self.schema.columns().iter().zip(values).enumerate() {
            let value = value.apply_affinity(col.affinity);
            if self.options.strict && !col.affinity.accepts(value.storage_class()) {
                return Err(BridgeError::constraint(
                    ConstraintKind::DataType,
                    format!(
                        "cannot store {} value in {} column {}",
                        value.typeof_str().to_ascii_uppercase(),
                        col.decl_type,
                        self.qualified(i)
                    ),
                ));
            }
            if self.options.max_value_len > 0 && value.byte_len() > self.options.max_value_len {
                return Err(BridgeError::constraint(
                    ConstraintKind::Check,
                    format!(
                        "{} exceeds {} bytes",
                        self.qualified(i),
                        self.options.max_value_len
                    ),
                ));
            }
            if col.not_null && value.is_null() {
                return Err(BridgeError::constraint(ConstraintKind::NotNull, self.qualified(i)));
            }
            if col.primary_key
                && rows
                    .iter()
                    .any(|(rowid, other)| Some(*rowid) != exclude && other.get(i) == Some(&value))
            {
                return Err(BridgeError::constraint(ConstraintKind::Unique, self.qualified(i)));
            }
            row.push(value);
        }
        Ok(row)
    }

    fn merge(old: &[SqlValue], values: Row, unchanged: ColumnMask) -> Row {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                if unchanged.contains(i) {
                    old.get(i).cloned().unwrap_or(SqlValue::Null)
                } else {
                    v
                }
            })
            .collect()
    }

    fn duplicate_rowid(&self, rowid: i64) -> BridgeError {
        BridgeError::constraint(
            ConstraintKind::Unique,
            format!("{}.rowid {rowid} already exists", self.name),
        )
    }

    fn missing_row(&self, key: &RowKey) -> BridgeError {
        BridgeError::misuse(format!("memtable {}: no row with {key}", self.name))
    }

    /// Map key of the row `key` names.
    fn locate(&self, rows: &BTreeMap<i64, Row>, key: &RowKey) -> Option<i64> {
        match key {
            RowKey::Rowid(r) => rows.contains_key(r).then_some(*r),
            RowKey::Primary(value) => {
                let pk = self.schema.primary_key()?;
                let value = value.clone().apply_affinity(self.schema.columns()[pk].affinity);
                rows.iter()
                    .find(|(_, row)| row.get(pk) == Some(&value))
                    .map(|(&slot, _)| slot)
            }
        }
    }

    fn next_rowid(rows: &BTreeMap<i64, Row>) -> Result<i64> {
        match rows.last_key_value() {
            None => Ok(1),
            Some((&max, _)) => max
                .checked_add(1)
                .ok_or_else(|| BridgeError::message("database or disk is full")),
        }
    }

    /// Mirror `rowid` into the `INTEGER PRIMARY KEY` column, if there is one.
    fn with_rowid(&self, mut values: Row, rowid: i64) -> Row {
        if let Some(slot) = self.schema.rowid_alias().and_then(|c| values.get_mut(c)) {
            *slot = SqlValue::Integer(rowid);
        }
        values
    }

    fn insert_row(&self, rows: &mut Rows, key: Option<RowKey>, values: Row) -> Result<Option<i64>> {
        if self.options.without_rowid {
            let mut values = values;
            let empty_pk = self
                .schema
                .primary_key()
                .and_then(|pk| values.get_mut(pk))
                .filter(|cell| cell.is_null());
            if let (Some(RowKey::Primary(value)), Some(cell)) = (key, empty_pk) {
                *cell = value;
            }
            let row = self.check_row(rows, values, None)?;
            let slot = Self::next_rowid(rows)?;
            Arc::make_mut(rows).insert(slot, row);
            return Ok(None);
        }
        let rowid = match key {
            Some(RowKey::Rowid(r)) if rows.contains_key(&r) => return Err(self.duplicate_rowid(r)),
            Some(RowKey::Rowid(r)) => r,
            Some(key @ RowKey::Primary(_)) => {
                return Err(BridgeError::misuse(format!(
                    "memtable {}: {key} given for a rowid table",
                    self.name
                )));
            }
            None => Self::next_rowid(rows)?,
        };
        let row = self.check_row(rows, self.with_rowid(values, rowid), None)?;
        Arc::make_mut(rows).insert(rowid, row);
        Ok(Some(rowid))
    }

    fn update_row(
        &self,
        rows: &mut Rows,
        old_key: &RowKey,
        new_key: Option<RowKey>,
        values: Row,
        unchanged: ColumnMask,
    ) -> Result<()> {
        let slot = self
            .locate(rows, old_key)
            .ok_or_else(|| self.missing_row(old_key))?;
        let merged = Self::merge(&rows[&slot], values, unchanged);
        match new_key {
            None => {
                let row = self.check_row(rows, self.with_rowid(merged, slot), Some(slot))?;
                Arc::make_mut(rows).insert(slot, row);
            }
            Some(RowKey::Primary(value)) => {
                // The slot stays put; only the key column changes.
                let mut merged = merged;
                if let Some(cell) = self.schema.primary_key().and_then(|pk| merged.get_mut(pk)) {
                    *cell = value;
                }
                let row = self.check_row(rows, merged, Some(slot))?;
                Arc::make_mut(rows).insert(slot, row);
            }
            Some(RowKey::Rowid(new_rowid)) => {
                if rows.contains_key(&new_rowid) {
                    return Err(self.duplicate_rowid(new_rowid));
                }
                let row = self.check_row(rows, self.with_rowid(merged, new_rowid), Some(slot))?;
                let rows = Arc::make_mut(rows);
                rows.remove(&slot);
                rows.insert(new_rowid, row);
            }
        }
        Ok(())
    }

    fn restore(&self, rows: &Rows) {
        *self.store.lock() = Arc::clone(rows);
    }
}

impl VirtualTable for MemTable {
    type Cursor = MemCursor;
    type Aux = MemCatalog;

    fn create(_cx: &Cx, ctx: &mut VtabContext, aux: &MemCatalog, args: &[&str]) -> Result<Self> {
        Self::attach(ctx, aux, args, true)
    }

    fn connect(_cx: &Cx, ctx: &mut VtabContext, aux: &MemCatalog, args: &[&str]) -> Result<Self> {
        Self::attach(ctx, aux, args, false)
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome> {
        let row_count = self.store.lock().len();
        plan::plan(info, &self.schema, row_count)?;
        Ok(BestIndexOutcome::Accept)
    }

    fn open(&self) -> Result<MemCursor> {
        Ok(MemCursor {
            store: Arc::clone(&self.store),
            without_rowid: self.options.without_rowid,
            snapshot: Rows::default(),
            ids: Vec::new(),
            pos: 0,
        })
    }

    fn disconnect(&mut self, _cx: &Cx) -> Result<()> {
        debug!(table = %self.name, "memtable: disconnected");
        Ok(())
    }

    fn destroy(&mut self, _cx: &Cx) -> Result<()> {
        let dropped = self.catalog.drop_table(&self.name);
        info!(table = %self.name, dropped, "memtable: destroyed");
        Ok(())
    }

    fn update(&mut self, _cx: &Cx, op: UpdateOp) -> Result<Option<i64>> {
        if self.options.read_only {
            return Err(BridgeError::constraint(
                ConstraintKind::ReadOnly,
                format!("table {} is read-only", self.name),
            ));
        }
        let store = Arc::clone(&self.store);
        let mut guard = store.lock();
        let rows = &mut *guard;
        match op {
            UpdateOp::Delete { key } => {
                match self.locate(rows, &key) {
                    Some(slot) => {
                        Arc::make_mut(rows).remove(&slot);
                    }
                    None => debug!(table = %self.name, %key, "memtable: delete of a missing row"),
                }
                Ok(None)
            }
            UpdateOp::Insert { key, values } => self.insert_row(rows, key, values),
            UpdateOp::Update {
                key,
                values,
                unchanged,
            } => {
                self.update_row(rows, &key, None, values, unchanged)?;
                Ok(None)
            }
            UpdateOp::UpdateWithKeyChange {
                old_key,
                new_key,
                values,
                unchanged,
            } => {
                self.update_row(rows, &old_key, Some(new_key), values, unchanged)?;
                Ok(None)
            }
        }
    }

    fn begin(&mut self, _cx: &Cx) -> Result<()> {
        self.txn = Some(Arc::clone(&*self.store.lock()));
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx) -> Result<()> {
        if self.options.fail_sync {
            debug!(table = %self.name, "memtable: sync failing on request");
            return Err(BridgeError::Busy);
        }
        Ok(())
    }

    fn commit(&mut self, _cx: &Cx) -> Result<()> {
        self.txn = None;
        self.savepoints.clear();
        Ok(())
    }

    fn rollback(&mut self, _cx: &Cx) -> Result<()> {
        if let Some(rows) = self.txn.take() {
            self.restore(&rows);
        }
        self.savepoints.clear();
        Ok(())
    }

    fn find_function(&self, n_arg: i32, name: &str) -> FindFunction {
        if n_arg != 2 || !name.eq_ignore_ascii_case("prefix") {
            return FindFunction::NotOverloaded;
        }
        let function: Arc<dyn ScalarFunction> = Arc::new(PrefixFunction);
        match FunctionOp::new(PREFIX_OP) {
            Ok(op) => FindFunction::OverloadedAsOperator(function, op),
            Err(_) => FindFunction::Overloaded(function),
        }
    }

    fn rename(&mut self, _cx: &Cx, new_name: &str) -> Result<()> {
        self.catalog.rename(&self.name, new_name)?;
        info!(from = %self.name, to = new_name, "memtable: renamed");
        new_name.clone_into(&mut self.name);
        Ok(())
    }

    fn savepoint(&mut self, _cx: &Cx, id: i32) -> Result<()> {
        let rows = Arc::clone(&*self.store.lock());
        self.savepoints.savepoint(id, rows);
        Ok(())
    }

    fn release(&mut self, _cx: &Cx, id: i32) -> Result<()> {
        self.savepoints.release(id);
        Ok(())
    }

    fn rollback_to(&mut self, _cx: &Cx, id: i32) -> Result<()> {
        if let Some(rows) = self.savepoints.rollback_to(id) {
            *self.store.lock() = Arc::clone(rows);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Scan over the rows a table held when `filter` ran.
pub struct MemCursor {
    store: SharedRows,
    without_rowid: bool,
    snapshot: Rows,
    ids: Vec<i64>,
    pos: usize,
}

fn lower_op(edge: Edge) -> ConstraintOp {
    match edge {
        Edge::Inclusive => ConstraintOp::Ge,
        Edge::Exclusive => ConstraintOp::Gt,
    }
}

fn upper_op(edge: Edge) -> ConstraintOp {
    match edge {
        Edge::Inclusive => ConstraintOp::Le,
        Edge::Exclusive => ConstraintOp::Lt,
    }
}

fn holds(op: ConstraintOp, lhs: &SqlValue, rhs: &SqlValue) -> bool {
    op.test(lhs, rhs) == Some(true)
}

impl MemCursor {
    fn select(&self, cx: &Cx, plan: &ScanPlan, args: &[SqlValue]) -> Result<Vec<i64>> {
        let mut args = args.iter();
        let mut next_arg = || {
            args.next()
                .ok_or_else(|| BridgeError::misuse("memtable: filter argument missing"))
        };
        let rows = &self.snapshot;
        let ids = match &plan.access {
            Access::FullScan => rows.keys().copied().collect(),
            Access::RowidEq => {
                let rhs = next_arg()?;
                match rhs.as_integer() {
                    Some(r) => rows.contains_key(&r).then_some(r).into_iter().collect(),
                    None => rows
                        .keys()
                        .copied()
                        .filter(|&r| holds(ConstraintOp::Eq, &SqlValue::Integer(r), rhs))
                        .collect(),
                }
            }
            Access::RowidRange { lower, upper } => {
                let lower = match lower {
                    Some(edge) => Some((lower_op(*edge), next_arg()?)),
                    None => None,
                };
                let upper = match upper {
                    Some(edge) => Some((upper_op(*edge), next_arg()?)),
                    None => None,
                };
                let start = match lower.and_then(|(op, rhs)| rhs.as_integer().map(|i| (op, i))) {
                    Some((ConstraintOp::Gt, i)) => Bound::Excluded(i),
                    Some((_, i)) => Bound::Included(i),
                    None => Bound::Unbounded,
                };
                rows.range((start, Bound::Unbounded))
                    .map(|(&r, _)| r)
                    .filter(|&r| {
                        let v = SqlValue::Integer(r);
                        lower.is_none_or(|(op, rhs)| holds(op, &v, rhs))
                            && upper.is_none_or(|(op, rhs)| holds(op, &v, rhs))
                    })
                    .collect()
            }
            Access::ColumnEq { column } => {
                let rhs = next_arg()?;
                rows.iter()
                    .filter(|(_, row)| row.get(*column).is_some_and(|v| holds(ConstraintOp::Eq, v, rhs)))
                    .map(|(&r, _)| r)
                    .collect()
            }
            Access::Prefix { column } => {
                let rhs = next_arg()?;
                rows.iter()
                    .filter(|(_, row)| {
                        row.get(*column)
                            .is_some_and(|v| PrefixFunction::matches(v, rhs) == Some(true))
                    })
                    .map(|(&r, _)| r)
                    .collect()
            }
        };
        cx.checkpoint()?;
        Ok(ids)
    }

    fn current(&self) -> Result<(i64, &Row)> {
        self.ids
            .get(self.pos)
            .and_then(|r| self.snapshot.get(r).map(|row| (*r, row)))
            .ok_or_else(|| BridgeError::misuse("memtable: cursor is not on a row"))
    }
}

impl VirtualTableCursor for MemCursor {
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()> {
        let plan = ScanPlan::from_idx_str(idx_str)?;
        self.snapshot = Arc::clone(&*self.store.lock());
        let mut ids = self.select(cx, &plan, args)?;
        if plan.desc {
            ids.reverse();
        }
        debug!(idx_num, ?plan, rows = ids.len(), "memtable: filter");
        self.ids = ids;
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        if self.pos < self.ids.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= self.ids.len()
    }

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
        let (_, row) = self.current()?;
        let value = usize::try_from(col)
            .ok()
            .and_then(|c| row.get(c))
            .ok_or_else(|| BridgeError::misuse(format!("memtable: no column {col}")))?;
        ctx.set_value(value.clone());
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        if self.without_rowid {
            return Err(BridgeError::Unsupported);
        }
        self.current().map(|(rowid, _)| rowid)
    }
}

#[cfg(test)]
#[allow(clippy::too_many_lines)]
mod tests {
    use vtbridge_vtab::{IndexConstraint, VtabHandle};

    use super::*;

    fn int(i: i64) -> SqlValue {
        SqlValue::Integer(i)
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_owned())
    }

    fn setup() -> (ModuleRegistry, MemCatalog, Cx) {
        let registry = ModuleRegistry::new();
        let catalog = MemCatalog::new();
        register(&registry, catalog.clone()).unwrap();
        (registry, catalog, Cx::new())
    }

    fn people(registry: &ModuleRegistry, cx: &Cx, extra: &[&str]) -> VtabHandle {
        let mut args = vec!["id INTEGER PRIMARY KEY", "name TEXT NOT NULL", "note TEXT HIDDEN"];
        args.extend_from_slice(extra);
        registry.create_table(cx, MEMTABLE, "people", &args).unwrap()
    }

    fn insert(table: &mut VtabHandle, cx: &Cx, id: i64, name: &str) -> Result<Option<i64>> {
        table.update(
            cx,
            &[SqlValue::Null, SqlValue::Null, int(id), text(name), SqlValue::Null],
            ColumnMask::EMPTY,
        )
    }

    fn scan(table: &VtabHandle, cx: &Cx, constraints: Vec<IndexConstraint>, rhs: &[SqlValue]) -> Vec<i64> {
        let mut info = IndexInfo::new(constraints, vec![]);
        table.best_index(&mut info).unwrap();
        let plan = vtbridge_vtab::IndexPlan::from_info(&info);
        let args = vtbridge_vtab::planner::filter_args(&plan, rhs).unwrap();
        let mut cursor = table.open().unwrap();
        cursor.filter_plan(cx, &plan, &args).unwrap();
        let mut ids = Vec::new();
        while !cursor.eof().unwrap() {
            ids.push(cursor.rowid().unwrap());
            cursor.next(cx).unwrap();
        }
        cursor.close(cx).unwrap();
        ids
    }

    #[test]
    fn test_extension_name_matches_crate_suffix() {
        let expected = env!("CARGO_PKG_NAME")
            .strip_prefix("vtbridge-ext-")
            .expect("extension crates should use vtbridge-ext-* naming");
        assert_eq!(extension_name(), expected);
    }

    #[test]
    fn test_integer_primary_key_is_the_rowid() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        assert_eq!(table.schema().star_columns(), vec![0, 1]);
        assert_eq!(insert(&mut table, &cx, 10, "ann").unwrap(), Some(10));
        assert_eq!(insert(&mut table, &cx, 20, "bob").unwrap(), Some(20));

        // No id: the next rowid is picked and written into the column.
        let auto = table
            .update(
                &cx,
                &[SqlValue::Null, SqlValue::Null, SqlValue::Null, text("cat"), SqlValue::Null],
                ColumnMask::EMPTY,
            )
            .unwrap();
        assert_eq!(auto, Some(21));
        let rows = catalog.rows("people").unwrap();
        assert_eq!(rows.get(&20), Some(&vec![int(20), text("bob"), SqlValue::Null]));
        assert_eq!(rows.get(&21), Some(&vec![int(21), text("cat"), SqlValue::Null]));

        let pk = IndexConstraint::new(0, ConstraintOp::Eq, true);
        assert_eq!(scan(&table, &cx, vec![pk], &[int(10)]), vec![10]);
    }

    #[test]
    fn test_connect_reattaches_and_destroy_drops() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        insert(&mut table, &cx, 1, "ann").unwrap();
        table.disconnect(&cx).unwrap();
        assert!(catalog.contains("people"));

        let mut again = registry
            .connect_table(&cx, MEMTABLE, "people", &["id INTEGER PRIMARY KEY", "name TEXT"])
            .unwrap();
        assert_eq!(scan(&again, &cx, vec![], &[]), vec![1]);
        again.destroy(&cx).unwrap();
        assert!(!catalog.contains("people"));

        let err = registry
            .connect_table(&cx, MEMTABLE, "people", &["id"])
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoSuchTable { .. }));
    }

    #[test]
    fn test_create_twice_fails() {
        let (registry, _catalog, cx) = setup();
        let _table = people(&registry, &cx, &[]);
        let err = registry
            .create_table(&cx, MEMTABLE, "PEOPLE", &["x"])
            .unwrap_err();
        assert!(matches!(err, BridgeError::TableExists { .. }));
    }

    #[test]
    fn test_constraints_enforced() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &["max_value_len=8"]);
        insert(&mut table, &cx, 1, "ann").unwrap();

        let err = insert(&mut table, &cx, 1, "dup").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::Unique,
                ..
            }
        ));
        let err = table
            .update(
                &cx,
                &[SqlValue::Null, SqlValue::Null, int(2), SqlValue::Null, SqlValue::Null],
                ColumnMask::EMPTY,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "NOT NULL constraint failed: people.name");
        let err = insert(&mut table, &cx, 3, "much too long").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::Check,
                ..
            }
        ));
        let err = table
            .update(
                &cx,
                &[SqlValue::Null, int(1), SqlValue::Null, text("x"), SqlValue::Null],
                ColumnMask::EMPTY,
            )
            .unwrap_err();
        assert!(err.to_string().contains("rowid 1 already exists"));
        assert!(table.last_error().is_some());
    }

    #[test]
    fn test_strict_affinity() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &["strict=1"]);
        // Numeric text converts losslessly under INTEGER affinity.
        table
            .update(
                &cx,
                &[SqlValue::Null, SqlValue::Null, text("7"), text("ann"), SqlValue::Null],
                ColumnMask::EMPTY,
            )
            .unwrap();
        let err = table
            .update(
                &cx,
                &[SqlValue::Null, SqlValue::Null, text("seven"), text("bob"), SqlValue::Null],
                ColumnMask::EMPTY,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::DataType,
                ..
            }
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &["read_only=1"]);
        let err = insert(&mut table, &cx, 1, "ann").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::ReadOnly,
                ..
            }
        ));
    }

    #[test]
    fn test_update_keeps_unchanged_columns() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        table
            .update(
                &cx,
                &[SqlValue::Null, int(5), SqlValue::Null, text("ann"), text("keep me")],
                ColumnMask::EMPTY,
            )
            .unwrap();
        table
            .update(
                &cx,
                &[int(5), int(5), int(5), text("anna"), SqlValue::Null],
                ColumnMask::from_columns([2]),
            )
            .unwrap();
        // Setting the id column moves the row.
        table
            .update(
                &cx,
                &[int(5), int(5), int(6), text("anna"), SqlValue::Null],
                ColumnMask::from_columns([2]),
            )
            .unwrap();
        let rows = catalog.rows("people").unwrap();
        assert!(!rows.contains_key(&5));
        assert_eq!(rows[&6], vec![int(6), text("anna"), text("keep me")]);

        table.update(&cx, &[int(6)], ColumnMask::EMPTY).unwrap();
        assert!(catalog.rows("people").unwrap().is_empty());
    }

    #[test]
    fn test_plans_select_matching_rows() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        for (id, name) in [(1, "ann"), (2, "andy"), (3, "bob"), (4, "anne")] {
            insert(&mut table, &cx, id * 10, name).unwrap();
        }
        let rowid_eq = IndexConstraint::new(-1, ConstraintOp::Eq, true);
        assert_eq!(scan(&table, &cx, vec![rowid_eq], &[int(30)]), vec![30]);

        let gt = IndexConstraint::new(-1, ConstraintOp::Gt, true);
        let le = IndexConstraint::new(-1, ConstraintOp::Le, true);
        assert_eq!(scan(&table, &cx, vec![gt, le], &[int(10), int(30)]), vec![20, 30]);

        let pk = IndexConstraint::new(0, ConstraintOp::Eq, true);
        assert_eq!(scan(&table, &cx, vec![pk], &[int(40)]), vec![40]);

        let name = IndexConstraint::new(1, ConstraintOp::Eq, true);
        assert_eq!(scan(&table, &cx, vec![name], &[text("bob")]), vec![30]);
    }

    #[test]
    fn test_prefix_overload_pushes_down() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        for (id, name) in [(1, "ann"), (2, "andy"), (3, "bob")] {
            insert(&mut table, &cx, id, name).unwrap();
        }
        let found = table.find_function(2, "PREFIX").unwrap();
        let op = found.operator().unwrap();
        assert_eq!(op.code(), PREFIX_OP);
        assert_eq!(table.function_operator("prefix", 2), Some(op));
        assert!(!table.find_function(1, "prefix").unwrap().is_overloaded());

        let f = found.function().unwrap();
        assert_eq!(f.invoke(&[text("andy"), text("an")]).unwrap(), int(1));
        assert_eq!(f.invoke(&[SqlValue::Null, text("an")]).unwrap(), SqlValue::Null);

        let constraint = IndexConstraint::new(1, op.constraint_op(), true);
        assert_eq!(scan(&table, &cx, vec![constraint], &[text("an")]), vec![1, 2]);
    }

    #[test]
    fn test_cursor_keeps_snapshot_across_updates() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        insert(&mut table, &cx, 1, "ann").unwrap();
        insert(&mut table, &cx, 2, "bob").unwrap();

        let mut cursor = table.open().unwrap();
        cursor.filter(&cx, 0, None, &[]).unwrap();
        table.update(&cx, &[int(1)], ColumnMask::EMPTY).unwrap();
        insert(&mut table, &cx, 3, "cat").unwrap();
        let rows = cursor.collect_rows(&cx, &[1]).unwrap();
        assert_eq!(rows, vec![vec![text("ann")], vec![text("bob")]]);
        cursor.close(&cx).unwrap();
    }

    #[test]
    fn test_transaction_rollback_restores_rows() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        insert(&mut table, &cx, 1, "ann").unwrap();

        table.begin(&cx).unwrap();
        insert(&mut table, &cx, 2, "bob").unwrap();
        table.rollback(&cx).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 1);

        table.begin(&cx).unwrap();
        insert(&mut table, &cx, 2, "bob").unwrap();
        table.sync(&cx).unwrap();
        table.commit(&cx).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 2);
    }

    #[test]
    fn test_savepoints_restore_nested_state() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        table.begin(&cx).unwrap();
        insert(&mut table, &cx, 1, "a").unwrap();
        table.savepoint(&cx, 1).unwrap();
        insert(&mut table, &cx, 2, "b").unwrap();
        table.savepoint(&cx, 2).unwrap();
        insert(&mut table, &cx, 3, "c").unwrap();

        table.rollback_to(&cx, 1).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 1);
        assert_eq!(table.savepoint_ids(), vec![1]);

        insert(&mut table, &cx, 4, "d").unwrap();
        table.rollback_to(&cx, 1).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 1);

        table.release(&cx, 1).unwrap();
        table.rollback_to(&cx, 1).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 1);
        table.rollback(&cx).unwrap();
        assert!(catalog.rows("people").unwrap().is_empty());
    }

    #[test]
    fn test_rename_moves_store() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        insert(&mut table, &cx, 1, "ann").unwrap();
        let _other = registry.create_table(&cx, MEMTABLE, "taken", &["x"]).unwrap();

        assert!(table.rename(&cx, "taken").is_err());
        assert_eq!(table.table_name(), "people");

        table.rename(&cx, "folks").unwrap();
        assert_eq!(table.table_name(), "folks");
        assert!(!catalog.contains("people"));
        assert_eq!(catalog.rows("folks").unwrap().len(), 1);
        insert(&mut table, &cx, 2, "bob").unwrap();
        assert_eq!(catalog.rows("folks").unwrap().len(), 2);
    }

    #[test]
    fn test_fail_sync_option() {
        let (registry, _catalog, cx) = setup();
        let mut table = people(&registry, &cx, &["fail_sync=1"]);
        table.begin(&cx).unwrap();
        assert!(matches!(table.sync(&cx), Err(BridgeError::Busy)));
        table.rollback(&cx).unwrap();
    }

    #[test]
    fn test_update_of_missing_row_is_misuse() {
        let (registry, catalog, cx) = setup();
        let mut table = people(&registry, &cx, &[]);
        insert(&mut table, &cx, 1, "ann").unwrap();

        for args in [
            vec![int(7), int(7), int(7), text("x"), SqlValue::Null],
            vec![int(7), int(8), int(8), text("x"), SqlValue::Null],
        ] {
            let err = table.update(&cx, &args, ColumnMask::EMPTY).unwrap_err();
            assert!(matches!(err, BridgeError::Misuse { .. }));
            assert!(err.to_string().contains("no row with rowid 7"));
        }
        // Deleting a missing row is a no-op.
        table.update(&cx, &[int(7)], ColumnMask::EMPTY).unwrap();
        assert_eq!(catalog.rows("people").unwrap().len(), 1);
    }

    fn kv(registry: &ModuleRegistry, cx: &Cx) -> VtabHandle {
        registry
            .create_table(cx, MEMTABLE, "kv", &["k TEXT PRIMARY KEY", "v INTEGER", "without_rowid=1"])
            .unwrap()
    }

    fn kv_rows(catalog: &MemCatalog) -> Vec<Row> {
        catalog.rows("kv").unwrap().values().cloned().collect()
    }

    #[test]
    fn test_without_rowid_rows_are_addressed_by_key() {
        let (registry, catalog, cx) = setup();
        let mut table = kv(&registry, &cx);
        assert!(table.schema().without_rowid());

        for (k, v) in [("a", 1), ("b", 2)] {
            let inserted = table
                .update(&cx, &[SqlValue::Null, SqlValue::Null, text(k), int(v)], ColumnMask::EMPTY)
                .unwrap();
            assert_eq!(inserted, None);
        }
        let err = table
            .update(&cx, &[SqlValue::Null, SqlValue::Null, text("a"), int(9)], ColumnMask::EMPTY)
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::Unique,
                ..
            }
        ));
        let err = table
            .update(&cx, &[SqlValue::Null, SqlValue::Null, SqlValue::Null, int(9)], ColumnMask::EMPTY)
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Constraint {
                kind: ConstraintKind::NotNull,
                ..
            }
        ));

        // UPDATE kv SET v = 20 WHERE k = 'b'
        table
            .update(&cx, &[text("b"), text("b"), SqlValue::Null, int(20)], ColumnMask::from_columns([0]))
            .unwrap();
        // UPDATE kv SET k = 'c' WHERE k = 'a'
        table
            .update(&cx, &[text("a"), text("c"), text("c"), int(1)], ColumnMask::EMPTY)
            .unwrap();
        assert_eq!(
            kv_rows(&catalog),
            vec![vec![text("c"), int(1)], vec![text("b"), int(20)]]
        );

        // Moving onto an existing key is a uniqueness violation.
        let err = table
            .update(&cx, &[text("c"), text("b"), text("b"), int(1)], ColumnMask::EMPTY)
            .unwrap_err();
        assert!(err.is_constraint());

        table.update(&cx, &[text("b")], ColumnMask::EMPTY).unwrap();
        assert_eq!(kv_rows(&catalog), vec![vec![text("c"), int(1)]]);

        let err = table
            .update(&cx, &[text("zz"), text("zz"), text("zz"), int(0)], ColumnMask::EMPTY)
            .unwrap_err();
        assert!(err.to_string().contains("no row with key 'zz'"));

        let mut cursor = table.open().unwrap();
        cursor.filter(&cx, 0, None, &[]).unwrap();
        assert_eq!(cursor.column(0).unwrap(), text("c"));
        assert!(matches!(cursor.rowid(), Err(BridgeError::Unsupported)));
        cursor.close(&cx).unwrap();
    }

    #[test]
    fn test_without_rowid_needs_primary_key() {
        let (registry, _catalog, cx) = setup();
        let err = registry
            .create_table(&cx, MEMTABLE, "bad", &["k TEXT", "without_rowid=1"])
            .unwrap_err();
        assert!(err.to_string().contains("PRIMARY KEY missing"));
    }

    #[test]
    fn test_no_columns_is_an_error() {
        let (registry, _catalog, cx) = setup();
        assert!(registry.create_table(&cx, MEMTABLE, "empty", &["strict=1"]).is_err());
    }
}
