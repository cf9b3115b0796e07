//! Function overloading through `find_function`.
//!
//! A table may supply its own implementation of a scalar function whose
//! first argument is one of its columns. Returning
//! [`FindFunction::OverloadedAsOperator`] additionally makes the function a
//! constraint operator in later `best_index` calls, so predicates like
//! `prefix(name, 'ab')` can be pushed down.
#![allow(clippy::unnecessary_literal_bound)]

use std::fmt;
use std::sync::Arc;

use vtbridge_error::{BridgeError, Result};
use vtbridge_types::SqlValue;

use crate::index::{ConstraintOp, FUNCTION_OP_MIN};

/// A scalar (row-level) SQL function.
///
/// Shared across threads as `Arc<dyn ScalarFunction>`.
pub trait ScalarFunction: Send + Sync {
    /// Execute this function on the given arguments.
    fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue>;

    /// Same inputs always give the same output. Defaults to `true`.
    fn is_deterministic(&self) -> bool {
        true
    }

    /// Accepted argument count; `-1` means variadic.
    fn num_args(&self) -> i32;

    fn name(&self) -> &str;
}

/// An operator code in the overloaded-function range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionOp(u8);

impl FunctionOp {
    /// Codes below [`FUNCTION_OP_MIN`] belong to built-in operators.
    pub fn new(code: u8) -> Result<Self> {
        if code < FUNCTION_OP_MIN {
            return Err(BridgeError::misuse(format!(
                "function operator code {code} is below {FUNCTION_OP_MIN}"
            )));
        }
        Ok(Self(code))
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    /// The constraint operator this code shows up as in `IndexInfo`.
    pub const fn constraint_op(self) -> ConstraintOp {
        ConstraintOp::Function(self.0)
    }
}

/// Result of `find_function`.
#[derive(Clone, Default)]
pub enum FindFunction {
    #[default]
    NotOverloaded,
    Overloaded(Arc<dyn ScalarFunction>),
    OverloadedAsOperator(Arc<dyn ScalarFunction>, FunctionOp),
}

impl FindFunction {
    pub fn function(&self) -> Option<&Arc<dyn ScalarFunction>> {
        match self {
            Self::NotOverloaded => None,
            Self::Overloaded(f) | Self::OverloadedAsOperator(f, _) => Some(f),
        }
    }

    pub fn operator(&self) -> Option<FunctionOp> {
        match self {
            Self::OverloadedAsOperator(_, op) => Some(*op),
            _ => None,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        !matches!(self, Self::NotOverloaded)
    }
}

impl fmt::Debug for FindFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOverloaded => f.write_str("NotOverloaded"),
            Self::Overloaded(func) => f.debug_tuple("Overloaded").field(&func.name()).finish(),
            Self::OverloadedAsOperator(func, op) => f
                .debug_tuple("OverloadedAsOperator")
                .field(&func.name())
                .field(&op.code())
                .finish(),
        }
    }
}
