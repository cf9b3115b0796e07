//! Typed column accessors over [`SqlValue`].
//!
//! `FromSql` is strict about storage class: a host asking for `i64` gets a
//! [`BridgeError::TypeMismatch`] for TEXT rather than a silent parse. Use
//! [`SqlValue::apply_affinity`] first when loose conversion is wanted.

use vtbridge_error::{BridgeError, Result};

use crate::SqlValue;

/// Conversion from a runtime value into a host type.
pub trait FromSql: Sized {
    fn from_sql(value: &SqlValue) -> Result<Self>;
}

/// Conversion from a host type into a runtime value.
pub trait ToSql {
    fn to_sql(&self) -> SqlValue;
}

fn mismatch(expected: &str, value: &SqlValue) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: expected.to_owned(),
        actual: value.typeof_str().to_owned(),
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        value.as_integer().ok_or_else(|| mismatch("integer", value))
    }
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        let wide = i64::from_sql(value)?;
        Self::try_from(wide).map_err(|_| BridgeError::TypeMismatch {
            expected: "32-bit integer".to_owned(),
            actual: wide.to_string(),
        })
    }
}

impl FromSql for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn from_sql(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Float(f) => Ok(*f),
            SqlValue::Integer(i) => Ok(*i as f64),
            other => Err(mismatch("real", other)),
        }
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        i64::from_sql(value).map(|i| i != 0)
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        value
            .as_text()
            .map(str::to_owned)
            .ok_or_else(|| mismatch("text", value))
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        value
            .as_blob()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| mismatch("blob", value))
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql(value).map(Some)
        }
    }
}

impl<T> ToSql for T
where
    T: Clone + Into<SqlValue>,
{
    fn to_sql(&self) -> SqlValue {
        self.clone().into()
    }
}

impl SqlValue {
    /// Typed read of this value.
    pub fn get<T: FromSql>(&self) -> Result<T> {
        T::from_sql(self)
    }
}
