//! Value/type bridge between the engine's dynamic values and typed host
//! accessors.

pub mod accessor;
pub mod cx;
pub mod value;

pub use accessor::{FromSql, ToSql};
pub use cx::Cx;
pub use value::SqlValue;

/// Fundamental storage classes of a runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StorageClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl StorageClass {
    /// Lower-case name, as reported by `typeof()`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Blob => "blob",
        }
    }
}

/// Preferred storage class of a declared column, used for loose typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TypeAffinity {
    /// INTEGER, INT, BIGINT, ...
    Integer,
    /// REAL, DOUBLE, FLOAT.
    Real,
    /// TEXT, VARCHAR, CLOB.
    Text,
    /// BLOB.
    Blob,
    /// No preference: empty declared type or anything unrecognised.
    None,
}

impl TypeAffinity {
    /// Determine the affinity for a declared column type.
    ///
    /// First-match rule:
    /// 1. Contains "INT" → INTEGER
    /// 2. Contains "CHAR", "CLOB", or "TEXT" → TEXT
    /// 3. Contains "BLOB" → BLOB
    /// 4. Contains "REAL", "FLOA", or "DOUB" → REAL
    /// 5. Otherwise (including empty) → NONE
    pub fn from_declared_type(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();

        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::None
        }
    }

    /// Whether a value of `class` may be stored without conversion.
    pub const fn accepts(self, class: StorageClass) -> bool {
        match (self, class) {
            (_, StorageClass::Null) | (Self::None, _) => true,
            (Self::Integer, StorageClass::Integer)
            | (Self::Real, StorageClass::Real | StorageClass::Integer)
            | (Self::Text, StorageClass::Text)
            | (Self::Blob, StorageClass::Blob) => true,
            _ => false,
        }
    }
}
