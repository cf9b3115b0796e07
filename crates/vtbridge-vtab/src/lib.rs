//! Virtual table module protocol.
//!
//! A host registers a [`Module`] wrapping a [`VirtualTable`] implementation
//! with a [`ModuleRegistry`]. The engine then drives every table through
//! the dispatch layer:
//! - construction via create / connect (or lazily, for eponymous modules)
//! - index negotiation with [`IndexInfo`] and the [`planner`] helpers
//! - scanning through [`CursorHandle`]
//! - writes decoded into [`UpdateOp`]
//! - two-phase commit and savepoints via [`TransactionCoordinator`]
//!
//! Every callback runs behind a boundary that records the module's error
//! message and converts panics into errors.

pub mod config;
pub mod dispatch;
pub mod function;
pub mod index;
pub mod module;
pub mod planner;
pub mod savepoint;
pub mod schema;
pub mod txn;
pub mod update;

pub use config::DispatchConfig;
pub use dispatch::{
    CursorHandle, CursorState, ModuleInfo, ModuleRegistry, RegisteredOperator, SharedVtab,
    TableState, TxnState, VtabHandle,
};
pub use function::{FindFunction, FunctionOp, ScalarFunction};
pub use index::{
    BestIndexOutcome, ColumnMask, ConstraintOp, IndexConstraint, IndexConstraintUsage, IndexFlags,
    IndexInfo, IndexOrderBy, IndexPlan,
};
pub use module::{
    Capabilities, ColumnContext, Module, VirtualTable, VirtualTableCursor, VtabConfig,
    VtabConfigFlags, VtabContext,
};
pub use planner::ProbeOutcome;
pub use savepoint::SavepointStack;
pub use schema::{ColumnDef, TableSchema};
pub use txn::TransactionCoordinator;
pub use update::{RowKey, UpdateOp};
