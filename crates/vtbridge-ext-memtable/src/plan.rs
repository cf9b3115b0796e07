//! Access strategies and their `idx_str` encoding.
//!
//! `best_index` picks one [`ScanPlan`] and ships it to `filter` as JSON in
//! `idx_str`; `idx_num` carries the same access kind as a small integer for
//! logging. Filter arguments always arrive in the order the plan lists them.

use serde::{Deserialize, Serialize};
use tracing::debug;
use vtbridge_error::{BridgeError, Result};
use vtbridge_vtab::{ConstraintOp, IndexFlags, IndexInfo, TableSchema};

use crate::PREFIX_OP;

/// Column index used for the rowid in constraints and ORDER BY terms.
pub const ROWID_COLUMN: i32 = -1;

/// Whether a range endpoint includes its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Inclusive,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Access {
    FullScan,
    /// `rowid = ?`
    RowidEq,
    /// `rowid >[=] ?` and/or `rowid <[=] ?`, lower bound first.
    RowidRange {
        lower: Option<Edge>,
        upper: Option<Edge>,
    },
    /// `column = ?`
    ColumnEq { column: usize },
    /// `prefix(column, ?)`
    Prefix { column: usize },
}

impl Access {
    pub const fn code(&self) -> i32 {
        match self {
            Self::FullScan => 0,
            Self::RowidEq => 1,
            Self::RowidRange { .. } => 2,
            Self::ColumnEq { .. } => 3,
            Self::Prefix { .. } => 4,
        }
    }
}

/// The strategy handed from `best_index` to `filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub access: Access,
    /// Emit rows in descending rowid order.
    #[serde(default)]
    pub desc: bool,
}

impl ScanPlan {
    pub const fn full_scan() -> Self {
        Self {
            access: Access::FullScan,
            desc: false,
        }
    }

    pub fn to_idx_str(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| BridgeError::internal(format!("memtable: encode plan: {e}")))
    }

    /// Decode `idx_str`; a missing string means a full scan.
    pub fn from_idx_str(idx_str: Option<&str>) -> Result<Self> {
        match idx_str {
            None => Ok(Self::full_scan()),
            Some(s) => serde_json::from_str(s)
                .map_err(|e| BridgeError::misuse(format!("memtable: bad idx_str {s:?}: {e}"))),
        }
    }
}

fn column_of(column: i32) -> Option<usize> {
    usize::try_from(column).ok()
}

/// Fill `info` with the cheapest strategy for this candidate.
///
/// Preference: rowid equality, PRIMARY KEY equality, any column equality,
/// rowid range, `prefix()`, full scan. Only usable constraints are
/// consulted, and nothing outside `info` is touched.
#[allow(clippy::cast_precision_loss)]
pub fn plan(info: &mut IndexInfo, schema: &TableSchema, row_count: usize) -> Result<ScanPlan> {
    let n = row_count as f64;
    let pk = schema.primary_key();
    let mut args: Vec<usize> = Vec::new();

    let (access, cost, rows, unique) = if let Some(i) =
        info.find_usable(ROWID_COLUMN, ConstraintOp::Eq)
    {
        args.push(i);
        (Access::RowidEq, 1.0, 1, true)
    } else if let Some((i, column)) = pk.and_then(|pk| {
        let col = i32::try_from(pk).ok()?;
        info.find_usable(col, ConstraintOp::Eq).map(|i| (i, pk))
    }) {
        args.push(i);
        (Access::ColumnEq { column }, 2.0, 1, true)
    } else if let Some((i, column)) = info
        .usable_constraints()
        .find(|(_, c)| c.op == ConstraintOp::Eq && column_of(c.column).is_some())
        .and_then(|(i, c)| column_of(c.column).map(|col| (i, col)))
    {
        args.push(i);
        (Access::ColumnEq { column }, 10.0 + n / 10.0, row_count / 10 + 1, false)
    } else {
        let lower = [(ConstraintOp::Gt, Edge::Exclusive), (ConstraintOp::Ge, Edge::Inclusive)]
            .into_iter()
            .find_map(|(op, edge)| info.find_usable(ROWID_COLUMN, op).map(|i| (i, edge)));
        let upper = [(ConstraintOp::Lt, Edge::Exclusive), (ConstraintOp::Le, Edge::Inclusive)]
            .into_iter()
            .find_map(|(op, edge)| info.find_usable(ROWID_COLUMN, op).map(|i| (i, edge)));
        let prefix = info
            .usable_constraints()
            .find(|(_, c)| c.op == ConstraintOp::Function(PREFIX_OP))
            .and_then(|(i, c)| column_of(c.column).map(|col| (i, col)));

        if lower.is_some() || upper.is_some() {
            args.extend(lower.map(|(i, _)| i));
            args.extend(upper.map(|(i, _)| i));
            let divisor = if lower.is_some() && upper.is_some() { 4.0 } else { 2.0 };
            (
                Access::RowidRange {
                    lower: lower.map(|(_, e)| e),
                    upper: upper.map(|(_, e)| e),
                },
                5.0 + n / divisor,
                row_count / 2 + 1,
                false,
            )
        } else if let Some((i, column)) = prefix {
            args.push(i);
            (Access::Prefix { column }, 20.0 + n / 4.0, row_count / 4 + 1, false)
        } else {
            (Access::FullScan, 100.0 + n, row_count.max(1), false)
        }
    };

    for (slot, &i) in args.iter().enumerate() {
        let argv_index = i32::try_from(slot + 1)
            .map_err(|_| BridgeError::internal("memtable: argument slot overflow"))?;
        info.use_constraint(i, argv_index, true);
    }

    let desc = match info.order_by.as_slice() {
        [order] if order.column == ROWID_COLUMN => {
            info.order_by_consumed = true;
            order.desc
        }
        _ => false,
    };

    let plan = ScanPlan { access, desc };
    info.idx_num = plan.access.code();
    info.set_idx_str(plan.to_idx_str()?);
    info.estimated_cost = cost;
    info.estimated_rows = i64::try_from(rows).unwrap_or(i64::MAX);
    if unique {
        info.idx_flags |= IndexFlags::SCAN_UNIQUE;
    }
    debug!(idx_num = info.idx_num, cost, "memtable: plan chosen");
    Ok(plan)
}
