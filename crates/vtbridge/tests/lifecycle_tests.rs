//! Integration tests for table and cursor lifecycles, hidden columns,
//! function overloading and rename, driven through the public facade.

use std::sync::Arc;

use parking_lot::Mutex;
use vtbridge::{
    BridgeError, ColumnContext, ColumnMask, ConstraintOp, Cx, DispatchConfig, IndexConstraint,
    IndexInfo, Module, ModuleRegistry, Result, ScalarFunction, SqlValue, VirtualTable,
    VirtualTableCursor, VtabContext, VtabHandle, builtin_registry, planner,
};
use vtbridge::{BestIndexOutcome, TableState};

fn int(i: i64) -> SqlValue {
    SqlValue::Integer(i)
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_owned())
}

// ===========================================================================
// Recording module
// ===========================================================================

#[derive(Default)]
struct Journal(Mutex<Vec<String>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    fn mentions(&self, table: &str) -> bool {
        self.0.lock().iter().any(|e| e.ends_with(&format!(" {table}")))
    }

    /// Every constructed instance was torn down exactly once, and every
    /// opened cursor was closed.
    fn assert_paired(&self) {
        let entries = self.0.lock().clone();
        let mut tables: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.split_once(' ').map(|(_, t)| t))
            .collect();
        tables.sort_unstable();
        tables.dedup();
        for table in tables {
            let built = self.count(&format!("create {table}")) + self.count(&format!("connect {table}"));
            let released =
                self.count(&format!("disconnect {table}")) + self.count(&format!("destroy {table}"));
            assert_eq!(built, released, "unpaired lifecycle for {table}: {entries:?}");
            assert_eq!(
                self.count(&format!("open {table}")),
                self.count(&format!("close {table}")),
                "unclosed cursor on {table}: {entries:?}"
            );
        }
    }
}

/// A two-column table (`n`, hidden `tag`) that journals every lifecycle
/// callback. Argument `fail` refuses construction; `no_schema` skips the
/// schema declaration.
struct Recorder {
    journal: Arc<Journal>,
    name: String,
}

impl Recorder {
    fn build(ctx: &mut VtabContext, journal: &Arc<Journal>, args: &[&str], op: &str) -> Result<Self> {
        if args.contains(&"fail") {
            return Err(BridgeError::message("recorder refused to start"));
        }
        if !args.contains(&"no_schema") {
            ctx.declare_schema("CREATE TABLE x(n INTEGER, tag TEXT HIDDEN)")?;
        }
        let name = ctx.table_name().to_owned();
        journal.push(format!("{op} {name}"));
        Ok(Self {
            journal: Arc::clone(journal),
            name,
        })
    }
}

impl VirtualTable for Recorder {
    type Cursor = RecorderCursor;
    type Aux = Arc<Journal>;

    fn create(_cx: &Cx, ctx: &mut VtabContext, aux: &Arc<Journal>, args: &[&str]) -> Result<Self> {
        Self::build(ctx, aux, args, "create")
    }

    fn connect(_cx: &Cx, ctx: &mut VtabContext, aux: &Arc<Journal>, args: &[&str]) -> Result<Self> {
        Self::build(ctx, aux, args, "connect")
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome> {
        info.idx_num = 1;
        Ok(BestIndexOutcome::Accept)
    }

    fn open(&self) -> Result<RecorderCursor> {
        self.journal.push(format!("open {}", self.name));
        Ok(RecorderCursor {
            journal: Arc::clone(&self.journal),
            table: self.name.clone(),
            pos: 0,
            len: 0,
        })
    }

    fn disconnect(&mut self, _cx: &Cx) -> Result<()> {
        self.journal.push(format!("disconnect {}", self.name));
        Ok(())
    }

    fn destroy(&mut self, _cx: &Cx) -> Result<()> {
        self.journal.push(format!("destroy {}", self.name));
        Ok(())
    }
}

struct RecorderCursor {
    journal: Arc<Journal>,
    table: String,
    pos: i64,
    len: i64,
}

impl VirtualTableCursor for RecorderCursor {
    fn filter(&mut self, _cx: &Cx, _idx_num: i32, _idx_str: Option<&str>, _args: &[SqlValue]) -> Result<()> {
        self.pos = 0;
        self.len = 3;
        Ok(())
    }

    fn next(&mut self, _cx: &Cx) -> Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= self.len
    }

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
        match col {
            0 => ctx.set_value(SqlValue::Integer(self.pos)),
            1 => ctx.set_value(SqlValue::Text(format!("tag{}", self.pos))),
            _ => {}
        }
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.pos)
    }

    fn close(self, _cx: &Cx) -> Result<()> {
        self.journal.push(format!("close {}", self.table));
        Ok(())
    }
}

fn recorder_registry() -> (ModuleRegistry, Arc<Journal>) {
    let journal = Arc::new(Journal::default());
    let registry = ModuleRegistry::new();
    registry
        .register("recorder", Module::<Recorder>::new().eponymous(), Arc::clone(&journal))
        .unwrap();
    (registry, journal)
}

// ===========================================================================
// 1. CONSTRUCTOR / TEARDOWN PAIRING
// ===========================================================================

#[test]
fn every_instance_is_torn_down_once() {
    let (registry, journal) = recorder_registry();
    let cx = Cx::new();
    {
        let mut t1 = registry.create_table(&cx, "recorder", "t1", &[]).unwrap();
        let mut cursor = t1.open().unwrap();
        cursor.filter(&cx, 1, None, &[]).unwrap();
        cursor.close(&cx).unwrap();
        t1.disconnect(&cx).unwrap();

        let mut again = registry.connect_table(&cx, "recorder", "t1", &[]).unwrap();
        again.destroy(&cx).unwrap();
        assert_eq!(again.state(), TableState::Destroyed);

        // Dropped at the end of the scope without an explicit teardown.
        let _t2 = registry.create_table(&cx, "recorder", "t2", &[]).unwrap();

        let implicit = registry.eponymous(&cx, "recorder").unwrap();
        let same = registry.eponymous(&cx, "RECORDER").unwrap();
        assert!(Arc::ptr_eq(&implicit, &same));
    }
    registry.shutdown(&cx).unwrap();

    assert_eq!(journal.count("create t1"), 1);
    assert_eq!(journal.count("connect t1"), 1);
    assert_eq!(journal.count("disconnect t2"), 1);
    assert_eq!(journal.count("connect recorder"), 1);
    assert_eq!(journal.count("disconnect recorder"), 1);
    journal.assert_paired();
}

#[test]
fn failed_constructor_has_no_teardown() {
    let (registry, journal) = recorder_registry();
    let cx = Cx::new();
    let err = registry
        .create_table(&cx, "recorder", "broken", &["fail"])
        .unwrap_err();
    assert!(err.to_string().contains("recorder refused to start"));
    assert!(!journal.mentions("broken"));
    journal.assert_paired();
}

#[test]
fn missing_schema_still_disconnects_the_instance() {
    let (registry, journal) = recorder_registry();
    let cx = Cx::new();
    let err = registry
        .create_table(&cx, "recorder", "shapeless", &["no_schema"])
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert_eq!(journal.count("create shapeless"), 1);
    assert_eq!(journal.count("disconnect shapeless"), 1);
    journal.assert_paired();
}

#[test]
fn teardown_waits_for_open_cursors() {
    let (registry, journal) = recorder_registry();
    let cx = Cx::new();
    let mut table = registry.create_table(&cx, "recorder", "busy", &[]).unwrap();
    let cursor = table.open().unwrap();
    assert_eq!(table.open_cursor_count(), 1);
    assert!(table.destroy(&cx).unwrap_err().is_protocol_violation());
    assert_eq!(table.state(), TableState::Connected);

    cursor.close(&cx).unwrap();
    assert_eq!(table.open_cursor_count(), 0);
    table.destroy(&cx).unwrap();
    assert_eq!(journal.count("destroy busy"), 1);
    journal.assert_paired();
}

#[test]
fn memtable_create_connect_destroy_cycle() {
    let (registry, catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let args = ["id INTEGER PRIMARY KEY", "name TEXT"];

    let mut first = registry.create_table(&cx, "memtable", "items", &args).unwrap();
    first
        .update(&cx, &[SqlValue::Null, SqlValue::Null, int(1), text("lamp")], ColumnMask::EMPTY)
        .unwrap();
    first.disconnect(&cx).unwrap();
    assert!(catalog.contains("items"));

    let mut second = registry.connect_table(&cx, "memtable", "ITEMS", &args).unwrap();
    let rows = catalog.rows("items").unwrap();
    assert_eq!(rows.len(), 1);
    second.destroy(&cx).unwrap();
    assert!(!catalog.contains("items"));

    let err = registry.connect_table(&cx, "memtable", "items", &args).unwrap_err();
    assert!(matches!(err, BridgeError::NoSuchTable { .. }));
}

// ===========================================================================
// 2. HIDDEN COLUMNS
// ===========================================================================

#[test]
fn hidden_columns_are_addressable_but_not_starred() {
    let (registry, _catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let series = registry.eponymous(&cx, "generate_series").unwrap();
    let table = series.lock();

    let schema = table.schema();
    assert_eq!(schema.len(), 4);
    assert_eq!(schema.star_columns(), vec![0]);
    assert_eq!(schema.visible_columns().len(), 1);
    assert!(schema.columns()[1..].iter().all(|c| c.hidden));

    // generate_series(1, 10, 3): call arguments bind to the hidden columns.
    let constraints: Vec<IndexConstraint> = (1..=3)
        .map(|col| IndexConstraint::new(col, ConstraintOp::Eq, true))
        .collect();
    let outcome = planner::probe(
        &table,
        &constraints,
        &[],
        ColumnMask::ALL,
        &[planner::declared_usable(&constraints)],
    )
    .unwrap();
    let args = planner::filter_args(&outcome.plan, &[int(1), int(10), int(3)]).unwrap();
    assert_eq!(args, vec![int(1), int(10), int(3)]);

    let mut cursor = table.open().unwrap();
    cursor.filter_plan(&cx, &outcome.plan, &args).unwrap();
    let rows = cursor.collect_rows(&cx, &[0, 1, 2, 3]).unwrap();
    cursor.close(&cx).unwrap();
    let expected: Vec<Vec<SqlValue>> = [1, 4, 7, 10]
        .into_iter()
        .map(|v| vec![int(v), int(1), int(10), int(3)])
        .collect();
    assert_eq!(rows, expected);
}

#[test]
fn implicit_insert_skips_hidden_columns() {
    let (registry, catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let mut notes = registry
        .create_table(&cx, "memtable", "notes", &["id INTEGER", "body TEXT", "author TEXT HIDDEN"])
        .unwrap();

    // INSERT INTO notes VALUES (7, 'hello')
    let implicit = notes.schema().implicit_insert_columns();
    assert_eq!(implicit, vec![0, 1]);
    let supplied = [int(7), text("hello")];
    let mut values = vec![SqlValue::Null; notes.schema().len()];
    for (&col, value) in implicit.iter().zip(supplied) {
        values[col] = value;
    }
    let mut args = vec![SqlValue::Null, SqlValue::Null];
    args.extend(values);
    let rowid = notes.update(&cx, &args, ColumnMask::EMPTY).unwrap().unwrap();

    let rows = catalog.rows("notes").unwrap();
    assert_eq!(rows[&rowid], vec![int(7), text("hello"), SqlValue::Null]);

    // SELECT * reads only the visible columns; the hidden one is still
    // readable by name.
    let star: Vec<i32> = notes
        .schema()
        .star_columns()
        .into_iter()
        .map(|c| i32::try_from(c).unwrap())
        .collect();
    let author = i32::try_from(notes.schema().column_index("AUTHOR").unwrap()).unwrap();
    let mut cursor = notes.open().unwrap();
    cursor.filter(&cx, 0, None, &[]).unwrap();
    assert_eq!(cursor.collect_rows(&cx, &star).unwrap(), vec![vec![int(7), text("hello")]]);
    cursor.filter(&cx, 0, None, &[]).unwrap();
    assert_eq!(cursor.column(author).unwrap(), SqlValue::Null);
    cursor.close(&cx).unwrap();
}

#[test]
fn recorder_hidden_column_reads_through_cursor() {
    let (registry, _journal) = recorder_registry();
    let cx = Cx::new();
    let table = registry.create_table(&cx, "recorder", "tags", &[]).unwrap();
    assert_eq!(table.schema().star_columns(), vec![0]);
    let mut cursor = table.open().unwrap();
    cursor.filter(&cx, 1, None, &[]).unwrap();
    assert_eq!(
        cursor.collect_rows(&cx, &[0, 1]).unwrap(),
        vec![
            vec![int(0), text("tag0")],
            vec![int(1), text("tag1")],
            vec![int(2), text("tag2")],
        ]
    );
    cursor.close(&cx).unwrap();
}

// ===========================================================================
// 3. FUNCTION OVERLOADING
// ===========================================================================

fn people(registry: &ModuleRegistry, cx: &Cx) -> VtabHandle {
    let mut table = registry
        .create_table(cx, "memtable", "people", &["id INTEGER PRIMARY KEY", "name TEXT"])
        .unwrap();
    for (id, name) in [(1, "ann"), (2, "bob"), (3, "andy")] {
        table
            .update(cx, &[SqlValue::Null, SqlValue::Null, int(id), text(name)], ColumnMask::EMPTY)
            .unwrap();
    }
    table
}

#[test]
fn overloaded_operator_is_pushed_into_the_scan() {
    let (registry, _catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let mut table = people(&registry, &cx);

    let found = table.find_function(2, "prefix").unwrap();
    let op = found.operator().unwrap();
    assert_eq!(op.code(), vtbridge::vtbridge_ext_memtable::PREFIX_OP);
    assert_eq!(table.function_operator("PREFIX", 2), Some(op));
    assert!(!table.find_function(1, "prefix").unwrap().is_overloaded());
    assert!(!table.find_function(2, "upper").unwrap().is_overloaded());

    let function = found.function().unwrap();
    assert_eq!(function.name(), "prefix");
    assert_eq!(function.invoke(&[text("andy"), text("an")]).unwrap(), int(1));
    assert_eq!(function.invoke(&[text("bob"), text("an")]).unwrap(), int(0));
    assert_eq!(function.invoke(&[SqlValue::Null, text("an")]).unwrap(), SqlValue::Null);

    // WHERE prefix(name, 'an')
    let constraints = vec![IndexConstraint::new(1, op.constraint_op(), true)];
    let outcome = planner::probe(
        &table,
        &constraints,
        &[],
        ColumnMask::ALL,
        &[planner::declared_usable(&constraints)],
    )
    .unwrap();
    assert!(!planner::needs_recheck(&outcome.plan, 0));
    let args = planner::filter_args(&outcome.plan, &[text("an")]).unwrap();

    let mut cursor = table.open().unwrap();
    cursor.filter_plan(&cx, &outcome.plan, &args).unwrap();
    let names = cursor.collect_rows(&cx, &[1]).unwrap();
    cursor.close(&cx).unwrap();
    assert_eq!(names, vec![vec![text("ann")], vec![text("andy")]]);
}

#[test]
fn find_function_without_capability_is_not_overloaded() {
    let (registry, _catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let series = registry.eponymous(&cx, "generate_series").unwrap();
    let mut table = series.lock();
    assert!(!table.find_function(2, "prefix").unwrap().is_overloaded());
    assert!(table.function_operators().is_empty());
}

// ===========================================================================
// 4. RENAME
// ===========================================================================

#[test]
fn rename_moves_storage_and_handle_name() {
    let (registry, catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let mut table = people(&registry, &cx);

    table.rename(&cx, "folks").unwrap();
    assert_eq!(table.table_name(), "folks");
    assert!(catalog.contains("folks"));
    assert!(!catalog.contains("people"));
    assert_eq!(catalog.rows("folks").unwrap().len(), 3);

    let _others = registry
        .create_table(&cx, "memtable", "others", &["x TEXT"])
        .unwrap();
    let err = table.rename(&cx, "OTHERS").unwrap_err();
    assert!(matches!(err, BridgeError::TableExists { .. }));
    assert_eq!(table.table_name(), "folks");
    assert!(table.last_error().is_some());
}

#[test]
fn rename_refused_without_capability() {
    let (registry, _catalog) = builtin_registry(DispatchConfig::default()).unwrap();
    let cx = Cx::new();
    let series = registry.eponymous(&cx, "generate_series").unwrap();
    let mut table = series.lock();
    assert!(table.rename(&cx, "series").is_err());
    assert_eq!(table.table_name(), "generate_series");
}
