//! Index negotiation records exchanged between planner and module.
//!
//! The planner fills the inputs of an [`IndexInfo`] (constraints, ORDER BY,
//! columns used), the module's `best_index` fills the outputs. The record
//! lives for exactly one call; anything the module needs later is encoded
//! into `idx_num` / `idx_str`, and the engine copies the outputs into an
//! [`IndexPlan`] before the record is dropped.

use std::borrow::Cow;
use std::collections::BTreeSet;

use bitflags::bitflags;
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::SqlValue;
use vtbridge_types::value::{sql_glob, sql_like};

/// Lowest operator code reserved for overloaded functions.
pub const FUNCTION_OP_MIN: u8 = 150;

/// Default `estimated_rows` when the module leaves it unset.
pub const DEFAULT_ESTIMATED_ROWS: i64 = 25;

/// Default `estimated_cost` when the module leaves it unset.
pub const DEFAULT_ESTIMATED_COST: f64 = 1_000_000.0;

/// Comparison operator for an index constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    /// An overloaded function registered through `find_function`
    /// (code ≥ [`FUNCTION_OP_MIN`]).
    Function(u8),
}

impl ConstraintOp {
    /// The engine's numeric operator code.
    pub const fn code(self) -> u8 {
        match self {
            Self::Eq => 2,
            Self::Gt => 4,
            Self::Le => 8,
            Self::Lt => 16,
            Self::Ge => 32,
            Self::Match => 64,
            Self::Like => 65,
            Self::Glob => 66,
            Self::Regexp => 67,
            Self::Ne => 68,
            Self::IsNot => 69,
            Self::IsNotNull => 70,
            Self::IsNull => 71,
            Self::Is => 72,
            Self::Function(code) => code,
        }
    }

    /// Decode an operator code. Unknown codes below the function range
    /// yield `None`.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            2 => Self::Eq,
            4 => Self::Gt,
            8 => Self::Le,
            16 => Self::Lt,
            32 => Self::Ge,
            64 => Self::Match,
            65 => Self::Like,
            66 => Self::Glob,
            67 => Self::Regexp,
            68 => Self::Ne,
            69 => Self::IsNot,
            70 => Self::IsNotNull,
            71 => Self::IsNull,
            72 => Self::Is,
            c if c >= FUNCTION_OP_MIN => Self::Function(c),
            _ => return None,
        })
    }

    /// Operators with no right-hand operand.
    pub const fn is_unary(self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }

    /// Evaluate `lhs <op> rhs` for the operators the engine itself knows.
    ///
    /// Returns `None` for MATCH, REGEXP, and function operators, whose
    /// meaning belongs to the module.
    pub fn test(self, lhs: &SqlValue, rhs: &SqlValue) -> Option<bool> {
        let either_null = lhs.is_null() || rhs.is_null();
        Some(match self {
            Self::Eq => !either_null && lhs == rhs,
            Self::Ne => !either_null && lhs != rhs,
            Self::Lt => !either_null && lhs < rhs,
            Self::Le => !either_null && lhs <= rhs,
            Self::Gt => !either_null && lhs > rhs,
            Self::Ge => !either_null && lhs >= rhs,
            Self::Is => lhs == rhs,
            Self::IsNot => lhs != rhs,
            Self::IsNull => lhs.is_null(),
            Self::IsNotNull => !lhs.is_null(),
            Self::Like => !either_null && sql_like(&rhs.to_text(), &lhs.to_text(), None),
            Self::Glob => !either_null && sql_glob(&rhs.to_text(), &lhs.to_text()),
            Self::Match | Self::Regexp | Self::Function(_) => return None,
        })
    }
}

/// A single WHERE-clause term the planner is considering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Column index (0-based, hidden columns counted; `-1` for rowid).
    pub column: i32,
    /// The comparison operator.
    pub op: ConstraintOp,
    /// Whether the planner can supply the right-hand value in this plan.
    pub usable: bool,
}

impl IndexConstraint {
    #[must_use]
    pub const fn new(column: i32, op: ConstraintOp, usable: bool) -> Self {
        Self { column, op, usable }
    }
}

/// A single ORDER BY term from the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOrderBy {
    /// Column index (0-based).
    pub column: i32,
    /// `true` if descending.
    pub desc: bool,
}

/// Per-constraint usage information set by `best_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexConstraintUsage {
    /// 1-based index into the `args` passed to `filter`; 0 = not consumed.
    pub argv_index: i32,
    /// The module guarantees the constraint; the engine may skip its
    /// recheck.
    pub omit: bool,
}

bitflags! {
    /// Scan flags reported by `best_index`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct IndexFlags: u32 {
        /// The scan visits at most one row.
        const SCAN_UNIQUE = 0x0000_0001;
    }
}

/// Bitmask of columns a statement reads.
///
/// Bit `i` covers column `i` for `i < 63`; bit 63 stands for "some column
/// at index 63 or above".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ColumnMask(pub u64);

impl ColumnMask {
    pub const OVERFLOW_BIT: u32 = 63;

    /// Every column.
    pub const ALL: Self = Self(u64::MAX);

    /// No column.
    pub const EMPTY: Self = Self(0);

    const fn bit_for(col: usize) -> u64 {
        if col >= Self::OVERFLOW_BIT as usize {
            1 << Self::OVERFLOW_BIT
        } else {
            1 << col
        }
    }

    #[must_use]
    pub fn from_columns(cols: impl IntoIterator<Item = usize>) -> Self {
        Self(cols.into_iter().fold(0, |acc, c| acc | Self::bit_for(c)))
    }

    #[must_use]
    pub const fn with(self, col: usize) -> Self {
        Self(self.0 | Self::bit_for(col))
    }

    /// Whether `col` may be read. Columns ≥ 63 share the overflow bit.
    pub const fn contains(self, col: usize) -> bool {
        self.0 & Self::bit_for(col) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// The planner's verdict request for one candidate plan.
///
/// `Reject` is not an error: it tells the planner to discard this candidate
/// (for example because a required argument is unusable in this join
/// order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestIndexOutcome {
    Accept,
    Reject,
}

/// Information exchanged between planner and virtual table during index
/// selection.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// WHERE clause constraints the planner is considering.
    pub constraints: Vec<IndexConstraint>,
    /// ORDER BY terms from the query.
    pub order_by: Vec<IndexOrderBy>,
    /// Columns the statement reads.
    pub col_used: ColumnMask,
    /// How each constraint maps to filter arguments (module fills this).
    pub constraint_usage: Vec<IndexConstraintUsage>,
    /// Integer identifier for the chosen strategy.
    pub idx_num: i32,
    /// Optional string payload for the chosen strategy. An owned value is
    /// released by the engine after `filter`; a borrowed static is not.
    pub idx_str: Option<Cow<'static, str>>,
    /// Whether the output is already in ORDER BY order.
    pub order_by_consumed: bool,
    /// Estimated cost of the scan (lower is better).
    pub estimated_cost: f64,
    /// Estimated number of rows returned.
    pub estimated_rows: i64,
    /// Scan flags.
    pub idx_flags: IndexFlags,
}

impl IndexInfo {
    /// Create a request with the given constraints and ORDER BY terms.
    #[must_use]
    pub fn new(constraints: Vec<IndexConstraint>, order_by: Vec<IndexOrderBy>) -> Self {
        let usage_len = constraints.len();
        Self {
            constraints,
            order_by,
            col_used: ColumnMask::ALL,
            constraint_usage: vec![IndexConstraintUsage::default(); usage_len],
            idx_num: 0,
            idx_str: None,
            order_by_consumed: false,
            estimated_cost: DEFAULT_ESTIMATED_COST,
            estimated_rows: DEFAULT_ESTIMATED_ROWS,
            idx_flags: IndexFlags::empty(),
        }
    }

    #[must_use]
    pub fn with_col_used(mut self, mask: ColumnMask) -> Self {
        self.col_used = mask;
        self
    }

    /// Usable constraints with their positions in `constraints`.
    pub fn usable_constraints(&self) -> impl Iterator<Item = (usize, &IndexConstraint)> {
        self.constraints.iter().enumerate().filter(|(_, c)| c.usable)
    }

    /// Position of the first usable constraint on `column` with `op`.
    pub fn find_usable(&self, column: i32, op: ConstraintOp) -> Option<usize> {
        self.usable_constraints()
            .find(|(_, c)| c.column == column && c.op == op)
            .map(|(i, _)| i)
    }

    /// Whether any constraint on `column` with `op` exists but is unusable.
    pub fn has_unusable(&self, column: i32, op: ConstraintOp) -> bool {
        self.constraints
            .iter()
            .any(|c| !c.usable && c.column == column && c.op == op)
    }

    /// Consume constraint `i` as filter argument `argv_index` (1-based).
    pub fn use_constraint(&mut self, i: usize, argv_index: i32, omit: bool) {
        if let Some(usage) = self.constraint_usage.get_mut(i) {
            usage.argv_index = argv_index;
            usage.omit = omit;
        }
    }

    /// Set an owned strategy string.
    pub fn set_idx_str(&mut self, s: impl Into<String>) {
        self.idx_str = Some(Cow::Owned(s.into()));
    }

    /// Set a static strategy string the engine must not release.
    pub fn set_static_idx_str(&mut self, s: &'static str) {
        self.idx_str = Some(Cow::Borrowed(s));
    }

    /// Whether the engine owns `idx_str` and must release it.
    pub fn must_free_idx_str(&self) -> bool {
        matches!(self.idx_str, Some(Cow::Owned(_)))
    }

    /// Check the module's answer for internal consistency.
    ///
    /// Argument slots must be 1..=n with no gaps or duplicates, and only
    /// usable constraints may be consumed.
    pub fn validate(&self) -> Result<()> {
        if self.constraint_usage.len() != self.constraints.len() {
            return Err(BridgeError::misuse(
                "xBestIndex malfunction: constraint usage length changed",
            ));
        }
        let mut seen = BTreeSet::new();
        for (constraint, usage) in self.constraints.iter().zip(&self.constraint_usage) {
            if usage.argv_index < 0 {
                return Err(BridgeError::misuse(format!(
                    "xBestIndex malfunction: negative argv_index {}",
                    usage.argv_index
                )));
            }
            if usage.argv_index == 0 {
                continue;
            }
            if !constraint.usable {
                return Err(BridgeError::misuse(format!(
                    "xBestIndex malfunction: unusable constraint on column {} consumed",
                    constraint.column
                )));
            }
            if !seen.insert(usage.argv_index) {
                return Err(BridgeError::misuse(format!(
                    "xBestIndex malfunction: argv_index {} assigned twice",
                    usage.argv_index
                )));
            }
        }
        let n = i32::try_from(seen.len())
            .map_err(|_| BridgeError::misuse("xBestIndex malfunction: too many arguments"))?;
        if seen.last().is_some_and(|&max| max != n) {
            return Err(BridgeError::misuse(
                "xBestIndex malfunction: argv_index values are not contiguous",
            ));
        }
        if self.estimated_cost.is_nan() {
            return Err(BridgeError::misuse("xBestIndex malfunction: NaN cost"));
        }
        Ok(())
    }
}

/// A by-value copy of a chosen strategy, detached from the request record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexPlan {
    pub idx_num: i32,
    pub idx_str: Option<String>,
    /// For each filter argument (in argv order), the constraint it carries.
    pub arg_constraints: Vec<usize>,
    /// Per-constraint "omit the recheck" flags, aligned with the request.
    pub omit: Vec<bool>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
    pub unique: bool,
}

impl IndexPlan {
    /// Copy the outputs out of a validated `IndexInfo`.
    pub fn from_info(info: &IndexInfo) -> Self {
        let mut args: Vec<(i32, usize)> = info
            .constraint_usage
            .iter()
            .enumerate()
            .filter(|(_, u)| u.argv_index > 0)
            .map(|(i, u)| (u.argv_index, i))
            .collect();
        args.sort_unstable();
        Self {
            idx_num: info.idx_num,
            idx_str: info.idx_str.as_ref().map(|s| s.clone().into_owned()),
            arg_constraints: args.into_iter().map(|(_, i)| i).collect(),
            omit: info
                .constraint_usage
                .iter()
                .map(|u| u.argv_index > 0 && u.omit)
                .collect(),
            order_by_consumed: info.order_by_consumed,
            estimated_cost: info.estimated_cost,
            estimated_rows: info.estimated_rows,
            unique: info.idx_flags.contains(IndexFlags::SCAN_UNIQUE),
        }
    }

    /// Number of arguments `filter` will receive.
    pub fn arg_count(&self) -> usize {
        self.arg_constraints.len()
    }
}
