//! Decoding of the single polymorphic mutation entry point.
//!
//! The engine passes `args[0]` (old row identifier), `args[1]` (new row
//! identifier), and the column values in `args[2..]`. The operation is
//! chosen purely by shape:
//!
//! | argc | args[0]            | args[1]  | operation                  |
//! |------|--------------------|----------|----------------------------|
//! | 1    | non-null           |          | delete                     |
//! | >1   | null               | any      | insert                     |
//! | >1   | non-null, = args[1]|          | update in place            |
//! | >1   | non-null, ≠ args[1]|          | update with key change     |
//!
//! On an ordinary table the identifier is the integer rowid. On a
//! `WITHOUT ROWID` table the identifier slots carry the PRIMARY KEY value
//! instead, whatever its type.

use std::fmt;

use vtbridge_error::{BridgeError, ConstraintKind, Result};
use vtbridge_types::{SqlValue, TypeAffinity};

use crate::index::ColumnMask;
use crate::schema::TableSchema;

/// Identifier of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowKey {
    Rowid(i64),
    /// PRIMARY KEY value of a `WITHOUT ROWID` table.
    Primary(SqlValue),
}

impl RowKey {
    pub const fn rowid(&self) -> Option<i64> {
        match self {
            Self::Rowid(r) => Some(*r),
            Self::Primary(_) => None,
        }
    }

    pub fn to_value(&self) -> SqlValue {
        match self {
            Self::Rowid(r) => SqlValue::Integer(*r),
            Self::Primary(v) => v.clone(),
        }
    }
}

impl From<i64> for RowKey {
    fn from(rowid: i64) -> Self {
        Self::Rowid(rowid)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rowid(r) => write!(f, "rowid {r}"),
            Self::Primary(v) => write!(f, "key {v}"),
        }
    }
}

/// A decoded mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Delete {
        key: RowKey,
    },
    /// `key` is `None` when the module should pick a rowid.
    Insert {
        key: Option<RowKey>,
        values: Vec<SqlValue>,
    },
    Update {
        key: RowKey,
        values: Vec<SqlValue>,
        /// Columns the statement left untouched.
        unchanged: ColumnMask,
    },
    UpdateWithKeyChange {
        old_key: RowKey,
        new_key: RowKey,
        values: Vec<SqlValue>,
        unchanged: ColumnMask,
    },
}

/// Where a table keeps its row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyLayout {
    /// Integer rowid, optionally mirrored by an `INTEGER PRIMARY KEY` column.
    Rowid { alias: Option<usize> },
    WithoutRowid { pk: usize },
}

impl KeyLayout {
    fn of(schema: &TableSchema) -> Self {
        match (schema.without_rowid(), schema.primary_key()) {
            (true, Some(pk)) => Self::WithoutRowid { pk },
            _ => Self::Rowid {
                alias: schema.rowid_alias(),
            },
        }
    }

    fn key_slot(self, value: &SqlValue, slot: usize) -> Result<RowKey> {
        match self {
            Self::Rowid { .. } => value.as_integer().map(RowKey::Rowid).ok_or_else(|| {
                BridgeError::constraint(
                    ConstraintKind::DataType,
                    format!("rowid slot {slot} holds {}", value.typeof_str()),
                )
            }),
            Self::WithoutRowid { .. } => Ok(RowKey::Primary(value.clone())),
        }
    }

    /// Identifier named by the key column among the new values, if any.
    fn key_column(self, values: &[SqlValue], unchanged: ColumnMask) -> Result<Option<RowKey>> {
        let col = match self {
            Self::Rowid { alias: None } => return Ok(None),
            Self::Rowid { alias: Some(col) } | Self::WithoutRowid { pk: col } => col,
        };
        let Some(value) = values.get(col).filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        if unchanged.contains(col) {
            return Ok(None);
        }
        if let Self::WithoutRowid { .. } = self {
            return Ok(Some(RowKey::Primary(value.clone())));
        }
        match value.clone().apply_affinity(TypeAffinity::Integer) {
            SqlValue::Integer(r) => Ok(Some(RowKey::Rowid(r))),
            other => Err(BridgeError::constraint(
                ConstraintKind::DataType,
                format!("datatype mismatch: rowid column holds {}", other.typeof_str()),
            )),
        }
    }
}

impl UpdateOp {
    /// Decode an engine argument vector for a table keyed by integer rowid.
    pub fn decode(args: &[SqlValue], unchanged: ColumnMask) -> Result<Self> {
        Self::decode_with(KeyLayout::Rowid { alias: None }, args, unchanged)
    }

    /// Decode an engine argument vector against the table's declared key.
    ///
    /// - `WITHOUT ROWID`: the identifier slots hold PRIMARY KEY values and
    ///   an INSERT takes its key from the PRIMARY KEY column.
    /// - `INTEGER PRIMARY KEY`: a non-null value in that column names the
    ///   new rowid, ahead of `args[1]`.
    pub fn decode_for(schema: &TableSchema, args: &[SqlValue], unchanged: ColumnMask) -> Result<Self> {
        Self::decode_with(KeyLayout::of(schema), args, unchanged)
    }

    fn decode_with(layout: KeyLayout, args: &[SqlValue], unchanged: ColumnMask) -> Result<Self> {
        match args {
            [] => Err(BridgeError::misuse("update called with no arguments")),
            [old] if old.is_null() => Err(BridgeError::misuse("delete with a NULL row identifier")),
            [old] => Ok(Self::Delete {
                key: layout.key_slot(old, 0)?,
            }),
            [old, new, values @ ..] => {
                if old.is_null() {
                    let key = match layout.key_column(values, ColumnMask::EMPTY)? {
                        Some(key) => Some(key),
                        None if new.is_null() => None,
                        None => Some(layout.key_slot(new, 1)?),
                    };
                    return Ok(Self::Insert {
                        key,
                        values: values.to_vec(),
                    });
                }
                if new.is_null() {
                    return Err(BridgeError::misuse("update without a new row identifier"));
                }
                let old_key = layout.key_slot(old, 0)?;
                let new_key = match layout.key_column(values, unchanged)? {
                    Some(key) => key,
                    None => layout.key_slot(new, 1)?,
                };
                let values = values.to_vec();
                if old_key == new_key {
                    Ok(Self::Update {
                        key: old_key,
                        values,
                        unchanged,
                    })
                } else {
                    Ok(Self::UpdateWithKeyChange {
                        old_key,
                        new_key,
                        values,
                        unchanged,
                    })
                }
            }
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Delete { .. } => "delete",
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::UpdateWithKeyChange { .. } => "update_key",
        }
    }

    /// New column values; empty for a delete.
    pub fn values(&self) -> &[SqlValue] {
        match self {
            Self::Delete { .. } => &[],
            Self::Insert { values, .. }
            | Self::Update { values, .. }
            | Self::UpdateWithKeyChange { values, .. } => values,
        }
    }

    /// The existing row the operation targets.
    pub const fn target_key(&self) -> Option<&RowKey> {
        match self {
            Self::Delete { key } | Self::Update { key, .. } => Some(key),
            Self::UpdateWithKeyChange { old_key, .. } => Some(old_key),
            Self::Insert { .. } => None,
        }
    }

    /// Whether column `col` was left unchanged by an UPDATE.
    pub const fn is_unchanged(&self, col: usize) -> bool {
        match self {
            Self::Update { unchanged, .. } | Self::UpdateWithKeyChange { unchanged, .. } => {
                unchanged.contains(col)
            }
            _ => false,
        }
    }
}
