//! Public API facade for vtbridge.
//!
//! Re-exports the protocol crates and wires up the bundled modules
//! (`generate_series` and `memtable`) so hosts and integration tests can get
//! a ready registry in one call.

pub use vtbridge_error::{BridgeError, ConstraintKind, ErrorCode, ExtendedCode, Result};
pub use vtbridge_ext_memtable::{MemCatalog, MemTable, MemTableOptions};
pub use vtbridge_ext_misc::GenerateSeriesTable;
pub use vtbridge_types::{Cx, FromSql, SqlValue, StorageClass, ToSql, TypeAffinity};
pub use vtbridge_vtab::{
    BestIndexOutcome, Capabilities, ColumnContext, ColumnDef, ColumnMask, ConstraintOp,
    CursorHandle, CursorState, DispatchConfig, FindFunction, FunctionOp, IndexConstraint,
    IndexConstraintUsage, IndexFlags, IndexInfo, IndexOrderBy, IndexPlan, Module, ModuleInfo,
    ModuleRegistry, ProbeOutcome, RowKey, SavepointStack, ScalarFunction, SharedVtab, TableSchema,
    TableState, TransactionCoordinator, TxnState, UpdateOp, VirtualTable, VirtualTableCursor,
    VtabConfig, VtabContext, VtabHandle,
};
pub use vtbridge_vtab::planner;
pub use {vtbridge_ext_memtable, vtbridge_ext_misc};

use tracing::info;

/// A registry with every bundled module registered, plus the catalog
/// backing its memtables.
pub fn builtin_registry(config: DispatchConfig) -> Result<(ModuleRegistry, MemCatalog)> {
    let registry = ModuleRegistry::with_config(config);
    let catalog = MemCatalog::new();
    vtbridge_ext_misc::register(&registry)?;
    vtbridge_ext_memtable::register(&registry, catalog.clone())?;
    info!(modules = ?registry.module_names(), "bundled modules registered");
    Ok((registry, catalog))
}
