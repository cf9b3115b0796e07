//! Engine-side driver of index negotiation.
//!
//! The planner may ask the same table many times with different usable
//! flags (one candidate per join order). Each call gets a fresh
//! [`IndexInfo`]; only the winning answer survives, copied into an
//! [`IndexPlan`].

use tracing::{debug, warn};
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::SqlValue;

use crate::dispatch::VtabHandle;
use crate::index::{BestIndexOutcome, ColumnMask, IndexConstraint, IndexInfo, IndexOrderBy, IndexPlan};

/// The winning plan of a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub plan: IndexPlan,
    /// Index of the winning candidate.
    pub candidate: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// The usable flags the constraints already carry, as a single candidate.
pub fn declared_usable(constraints: &[IndexConstraint]) -> Vec<bool> {
    constraints.iter().map(|c| c.usable).collect()
}

/// A fresh request carrying the table's configured default estimates.
pub fn request(
    table: &VtabHandle,
    constraints: Vec<IndexConstraint>,
    order_by: Vec<IndexOrderBy>,
    col_used: ColumnMask,
) -> IndexInfo {
    let mut info = IndexInfo::new(constraints, order_by).with_col_used(col_used);
    info.estimated_rows = table.config().default_estimated_rows;
    info.estimated_cost = table.config().default_estimated_cost;
    info
}

#[allow(clippy::float_cmp)]
fn better(candidate: &IndexPlan, best: &IndexPlan) -> bool {
    candidate.estimated_cost < best.estimated_cost
        || (candidate.estimated_cost == best.estimated_cost
            && candidate.estimated_rows < best.estimated_rows)
}

/// Call `best_index` once per usable-mask in `candidates` and keep the
/// cheapest accepted answer (cost, then rows; earlier wins a tie).
///
/// Rejected candidates are skipped. Any error aborts the probe. If every
/// candidate is rejected the query has no solution.
pub fn probe(
    table: &VtabHandle,
    constraints: &[IndexConstraint],
    order_by: &[IndexOrderBy],
    col_used: ColumnMask,
    candidates: &[Vec<bool>],
) -> Result<ProbeOutcome> {
    let limit = table.config().max_probe_candidates;
    if candidates.len() > limit {
        warn!(
            table = table.table_name(),
            candidates = candidates.len(),
            limit,
            "probe candidates truncated"
        );
    }

    let mut best: Option<ProbeOutcome> = None;
    let mut accepted = 0;
    let mut rejected = 0;
    for (n, usable) in candidates.iter().take(limit).enumerate() {
        if usable.len() != constraints.len() {
            return Err(BridgeError::misuse(format!(
                "candidate {n} has {} usable flags for {} constraints",
                usable.len(),
                constraints.len()
            )));
        }
        let masked = constraints
            .iter()
            .zip(usable)
            .map(|(c, &u)| IndexConstraint { usable: u, ..c.clone() })
            .collect();
        let mut info = request(table, masked, order_by.to_vec(), col_used);
        match table.best_index(&mut info)? {
            BestIndexOutcome::Reject => {
                rejected += 1;
                debug!(table = table.table_name(), candidate = n, "candidate rejected");
            }
            BestIndexOutcome::Accept => {
                accepted += 1;
                let plan = IndexPlan::from_info(&info);
                if best.as_ref().is_none_or(|b| better(&plan, &b.plan)) {
                    best = Some(ProbeOutcome {
                        plan,
                        candidate: n,
                        accepted: 0,
                        rejected: 0,
                    });
                }
            }
        }
    }

    let mut outcome = best.ok_or_else(|| {
        BridgeError::message(format!("no query solution for {}", table.table_name()))
    })?;
    outcome.accepted = accepted;
    outcome.rejected = rejected;
    debug!(
        table = table.table_name(),
        candidate = outcome.candidate,
        idx_num = outcome.plan.idx_num,
        cost = outcome.plan.estimated_cost,
        "plan chosen"
    );
    Ok(outcome)
}

/// Build the `filter` arguments in argv order. `rhs` holds the right-hand
/// value of every constraint, aligned with the request.
pub fn filter_args(plan: &IndexPlan, rhs: &[SqlValue]) -> Result<Vec<SqlValue>> {
    plan.arg_constraints
        .iter()
        .map(|&i| {
            rhs.get(i).cloned().ok_or_else(|| {
                BridgeError::misuse(format!("no right-hand value for constraint {i}"))
            })
        })
        .collect()
}

/// Whether the engine must still evaluate constraint `i` itself.
pub fn needs_recheck(plan: &IndexPlan, i: usize) -> bool {
    !plan.omit.get(i).copied().unwrap_or(false)
}
