//! Miscellaneous table-valued modules: `generate_series`.
//!
//! `generate_series(START, STOP [, STEP])` is an eponymous virtual table. The
//! call arguments bind to the hidden columns `start`, `stop` and `step`, so
//!
//! ```sql
//! SELECT value FROM generate_series(1, 10, 3)
//! ```
//!
//! is planned as `value` with `start = 1 AND stop = 10 AND step = 3`.
//!
//! The series is `START, START+STEP, ...` up to and including `STOP`; a
//! negative step counts down. Missing arguments default to `START = 0`,
//! `STOP = 4294967295` and `STEP = 1`. A NULL argument yields no rows.

use tracing::debug;
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::{Cx, SqlValue};
use vtbridge_vtab::{
    BestIndexOutcome, ColumnContext, ConstraintOp, IndexInfo, Module, ModuleRegistry,
    VirtualTable, VirtualTableCursor, VtabConfig, VtabContext,
};

#[must_use]
pub const fn extension_name() -> &'static str {
    "misc"
}

/// Name the module is registered under.
pub const GENERATE_SERIES: &str = "generate_series";

const SCHEMA: &str = "CREATE TABLE x(value, start HIDDEN, stop HIDDEN, step HIDDEN)";

const COL_VALUE: i32 = 0;
const COL_START: i32 = 1;
const COL_STOP: i32 = 2;
const COL_STEP: i32 = 3;

const DEFAULT_STOP: i64 = 0xffff_ffff;

/// Bits of the `idx_num` strategy produced by `best_index`.
///
/// Filter arguments arrive in bit order: start, stop, step, then the lower
/// and upper bound on `value`.
pub mod idx {
    pub const START: i32 = 0x01;
    pub const STOP: i32 = 0x02;
    pub const STEP: i32 = 0x04;
    pub const VALUE_EQ: i32 = 0x08;
    pub const VALUE_GE: i32 = 0x10;
    pub const VALUE_GT: i32 = 0x20;
    pub const VALUE_LE: i32 = 0x40;
    pub const VALUE_LT: i32 = 0x80;
    pub const ORDER_ASC: i32 = 0x100;
    pub const ORDER_DESC: i32 = 0x200;
}

/// Register `generate_series` with `registry`.
pub fn register(registry: &ModuleRegistry) -> Result<()> {
    registry.register(GENERATE_SERIES, Module::<GenerateSeriesTable>::new(), ())
}

// ══════════════════════════════════════════════════════════════════════
// generate_series virtual table
// ══════════════════════════════════════════════════════════════════════

/// Virtual table that generates an arithmetic sequence of integers.
pub struct GenerateSeriesTable;

impl VirtualTable for GenerateSeriesTable {
    type Cursor = GenerateSeriesCursor;
    type Aux = ();

    fn connect(_cx: &Cx, ctx: &mut VtabContext, _aux: &(), _args: &[&str]) -> Result<Self> {
        ctx.declare_schema(SCHEMA)?;
        ctx.config(VtabConfig::Innocuous);
        Ok(Self)
    }

    #[allow(clippy::cast_precision_loss)]
    fn best_index(&self, info: &mut IndexInfo) -> Result<BestIndexOutcome> {
        // A START argument that exists but cannot be supplied in this join
        // order makes the plan unusable rather than silently defaulted.
        if info.has_unusable(COL_START, ConstraintOp::Eq) {
            debug!("generate_series: start constraint unusable, rejecting plan");
            return Ok(BestIndexOutcome::Reject);
        }

        let mut idx_num = 0;
        let mut slots: Vec<usize> = Vec::with_capacity(5);
        for (bit, col) in [(idx::START, COL_START), (idx::STOP, COL_STOP), (idx::STEP, COL_STEP)] {
            if let Some(i) = info.find_usable(col, ConstraintOp::Eq) {
                idx_num |= bit;
                slots.push(i);
            }
        }

        let lower = [
            (idx::VALUE_EQ, ConstraintOp::Eq),
            (idx::VALUE_GE, ConstraintOp::Ge),
            (idx::VALUE_GT, ConstraintOp::Gt),
        ]
        .into_iter()
        .find_map(|(bit, op)| info.find_usable(COL_VALUE, op).map(|i| (bit, i)));
        if let Some((bit, i)) = lower {
            idx_num |= bit;
            slots.push(i);
        }
        if idx_num & idx::VALUE_EQ == 0 {
            let upper = [(idx::VALUE_LE, ConstraintOp::Le), (idx::VALUE_LT, ConstraintOp::Lt)]
                .into_iter()
                .find_map(|(bit, op)| info.find_usable(COL_VALUE, op).map(|i| (bit, i)));
            if let Some((bit, i)) = upper {
                idx_num |= bit;
                slots.push(i);
            }
        }

        for (n, &i) in slots.iter().enumerate() {
            let argv_index = i32::try_from(n + 1).unwrap_or(i32::MAX);
            // Hidden-column arguments are reported back verbatim, so the
            // engine need not recheck them. Bounds on `value` are rechecked.
            let omit = info.constraints[i].column != COL_VALUE;
            info.use_constraint(i, argv_index, omit);
        }

        if let [order] = info.order_by.as_slice() {
            if order.column == COL_VALUE {
                idx_num |= if order.desc {
                    idx::ORDER_DESC
                } else {
                    idx::ORDER_ASC
                };
                info.order_by_consumed = true;
            }
        }

        let bounded = idx_num & (idx::STOP | idx::VALUE_EQ | idx::VALUE_LE | idx::VALUE_LT) != 0;
        info.estimated_rows = if idx_num & idx::VALUE_EQ != 0 {
            1
        } else if bounded {
            1000
        } else {
            i64::from(u32::MAX)
        };
        info.estimated_cost = info.estimated_rows as f64;
        info.idx_num = idx_num;
        debug!(idx_num, "generate_series: plan chosen");
        Ok(BestIndexOutcome::Accept)
    }

    fn open(&self) -> Result<Self::Cursor> {
        Ok(GenerateSeriesCursor::default())
    }
}

/// Inclusive range of term indices `k` of the series `start + k * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Terms {
    first: i128,
    last: i128,
}

/// Lower bound `value >= b` implied by `op` and its right-hand side, or
/// `None` when no integer can satisfy it.
#[allow(clippy::cast_possible_truncation)]
fn lower_bound(op: i32, rhs: &SqlValue) -> Option<Option<i128>> {
    match rhs {
        SqlValue::Null => None,
        SqlValue::Integer(i) => {
            let i = i128::from(*i);
            Some(Some(if op == idx::VALUE_GT { i + 1 } else { i }))
        }
        SqlValue::Float(f) if f.is_nan() => None,
        SqlValue::Float(f) => Some(Some(if op == idx::VALUE_GT {
            f.floor() as i128 + 1
        } else {
            f.ceil() as i128
        })),
        // Integers sort before every TEXT and BLOB.
        SqlValue::Text(_) | SqlValue::Blob(_) => None,
    }
}

/// Upper bound `value <= b`; `Some(None)` means unbounded.
#[allow(clippy::cast_possible_truncation)]
fn upper_bound(op: i32, rhs: &SqlValue) -> Option<Option<i128>> {
    match rhs {
        SqlValue::Null => None,
        SqlValue::Integer(i) => {
            let i = i128::from(*i);
            Some(Some(if op == idx::VALUE_LT { i - 1 } else { i }))
        }
        SqlValue::Float(f) if f.is_nan() => None,
        SqlValue::Float(f) => Some(Some(if op == idx::VALUE_LT {
            f.ceil() as i128 - 1
        } else {
            f.floor() as i128
        })),
        SqlValue::Text(_) | SqlValue::Blob(_) => Some(None),
    }
}

fn ceil_div(a: i128, b: i128) -> i128 {
    -((-a).div_euclid(b))
}

/// Term indices of `start, start+step, ..` that stay within `stop` and
/// within the value bounds `lo..=hi`.
fn terms(start: i64, stop: i64, step: i64, lo: Option<i128>, hi: Option<i128>) -> Option<Terms> {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let span = stop - start;
    if span != 0 && (span < 0) != (step < 0) {
        return None;
    }
    let mut first = 0;
    let mut last = span / step;
    let magnitude = step.abs();
    if step > 0 {
        if let Some(lo) = lo {
            first = first.max(ceil_div(lo - start, magnitude));
        }
        if let Some(hi) = hi {
            last = last.min((hi - start).div_euclid(magnitude));
        }
    } else {
        if let Some(lo) = lo {
            last = last.min((start - lo).div_euclid(magnitude));
        }
        if let Some(hi) = hi {
            first = first.max(ceil_div(start - hi, magnitude));
        }
    }
    (first <= last).then_some(Terms { first, last })
}

/// Next filter argument if `bit` is set in `idx_num`.
fn take_arg<'a>(
    idx_num: i32,
    bit: i32,
    args: &mut std::slice::Iter<'a, SqlValue>,
) -> Result<Option<&'a SqlValue>> {
    if idx_num & bit == 0 {
        return Ok(None);
    }
    args.next().map(Some).ok_or_else(|| {
        BridgeError::misuse(format!("generate_series: missing argument for idx bit {bit:#x}"))
    })
}

/// Cursor over one generated series.
#[derive(Debug, Default)]
pub struct GenerateSeriesCursor {
    start: i64,
    stop: i64,
    step: i64,
    terms: Option<Terms>,
    current: i128,
    reverse: bool,
}

impl GenerateSeriesCursor {
    /// Position the cursor on the series `start..=stop` by `step`.
    #[allow(clippy::similar_names)]
    pub fn init(&mut self, start: i64, stop: i64, step: i64) -> Result<()> {
        self.init_bounded(start, stop, step, None, None, false)
    }

    #[allow(clippy::similar_names)]
    fn init_bounded(
        &mut self,
        start: i64,
        stop: i64,
        step: i64,
        lo: Option<i128>,
        hi: Option<i128>,
        reverse: bool,
    ) -> Result<()> {
        if step == 0 {
            return Err(BridgeError::message("generate_series: step cannot be zero"));
        }
        self.start = start;
        self.stop = stop;
        self.step = step;
        self.reverse = reverse;
        self.terms = terms(start, stop, step, lo, hi);
        if let Some(t) = self.terms {
            self.current = if reverse { t.last } else { t.first };
        }
        debug!(start, stop, step, reverse, "generate_series: initialized cursor");
        Ok(())
    }

    fn value(&self) -> Result<i64> {
        let v = i128::from(self.start) + self.current * i128::from(self.step);
        i64::try_from(v)
            .map_err(|_| BridgeError::internal(format!("generate_series: value {v} out of range")))
    }
}

impl VirtualTableCursor for GenerateSeriesCursor {
    #[allow(clippy::similar_names)]
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        _idx_str: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()> {
        cx.checkpoint()?;
        let mut args = args.iter();
        let start = take_arg(idx_num, idx::START, &mut args)?;
        let stop = take_arg(idx_num, idx::STOP, &mut args)?;
        let step = take_arg(idx_num, idx::STEP, &mut args)?;
        let lower_op = [idx::VALUE_EQ, idx::VALUE_GE, idx::VALUE_GT]
            .into_iter()
            .find(|bit| idx_num & bit != 0);
        let lower = match lower_op {
            Some(bit) => take_arg(idx_num, bit, &mut args)?,
            None => None,
        };
        let upper_op = [idx::VALUE_LE, idx::VALUE_LT]
            .into_iter()
            .find(|bit| idx_num & bit != 0);
        let upper = match upper_op {
            Some(bit) => take_arg(idx_num, bit, &mut args)?,
            None => None,
        };

        let hidden = [start, stop, step];
        if hidden.iter().flatten().any(|v| v.is_null()) {
            self.terms = None;
            return Ok(());
        }
        let start = start.map_or(0, SqlValue::to_integer);
        let stop = stop.map_or(DEFAULT_STOP, SqlValue::to_integer);
        let step = step.map_or(1, SqlValue::to_integer);

        let (mut lo, mut hi) = (None, None);
        if let (Some(op), Some(rhs)) = (lower_op, lower) {
            let Some(b) = lower_bound(op, rhs) else {
                self.terms = None;
                return Ok(());
            };
            lo = b;
            if op == idx::VALUE_EQ {
                hi = upper_bound(idx::VALUE_LE, rhs).flatten();
            }
        }
        if let (Some(op), Some(rhs)) = (upper_op, upper) {
            let Some(b) = upper_bound(op, rhs) else {
                self.terms = None;
                return Ok(());
            };
            hi = b;
        }

        let reverse = if idx_num & idx::ORDER_ASC != 0 {
            step < 0
        } else if idx_num & idx::ORDER_DESC != 0 {
            step > 0
        } else {
            false
        };
        self.init_bounded(start, stop, step, lo, hi, reverse)
    }

    fn next(&mut self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        let Some(t) = self.terms else {
            return Ok(());
        };
        if self.reverse {
            self.current -= 1;
        } else {
            self.current += 1;
        }
        if self.current < t.first || self.current > t.last {
            self.terms = None;
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        self.terms.is_none()
    }

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
        let val = match col {
            COL_VALUE => SqlValue::Integer(self.value()?),
            COL_START => SqlValue::Integer(self.start),
            COL_STOP => SqlValue::Integer(self.stop),
            COL_STEP => SqlValue::Integer(self.step),
            _ => SqlValue::Null,
        };
        ctx.set_value(val);
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        self.value()
    }
}

// ══════════════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════════════
