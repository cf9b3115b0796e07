use std::cmp::Ordering;
use std::fmt;

use crate::{StorageClass, TypeAffinity};

/// A dynamically-typed runtime value.
///
/// The engine has five fundamental storage classes: NULL, INTEGER, REAL,
/// TEXT, and BLOB.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A UTF-8 text string.
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Returns the storage class of this value.
    pub const fn storage_class(&self) -> StorageClass {
        match self {
            Self::Null => StorageClass::Null,
            Self::Integer(_) => StorageClass::Integer,
            Self::Float(_) => StorageClass::Real,
            Self::Text(_) => StorageClass::Text,
            Self::Blob(_) => StorageClass::Blob,
        }
    }

    /// Apply column affinity (advisory, never rejects).
    ///
    /// - TEXT: numbers become text.
    /// - INTEGER: well-formed numeric text is parsed; exact reals fold to
    ///   integers.
    /// - REAL: numeric text is parsed; integers widen to float.
    /// - BLOB / NONE: no conversion.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::float_cmp
    )]
    pub fn apply_affinity(self, affinity: TypeAffinity) -> Self {
        match affinity {
            TypeAffinity::Blob | TypeAffinity::None => self,
            TypeAffinity::Text => match self {
                Self::Integer(_) | Self::Float(_) => Self::Text(self.to_text()),
                other => other,
            },
            TypeAffinity::Integer => match &self {
                Self::Text(s) => coerce_text_to_numeric(s).unwrap_or(self),
                Self::Float(f) => {
                    if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(f) {
                        let i = *f as i64;
                        if (i as f64) == *f {
                            return Self::Integer(i);
                        }
                    }
                    self
                }
                _ => self,
            },
            TypeAffinity::Real => match &self {
                Self::Text(s) => coerce_text_to_numeric(s)
                    .map(|v| match v {
                        Self::Integer(i) => Self::Float(i as f64),
                        other => other,
                    })
                    .unwrap_or(self),
                Self::Integer(i) => Self::Float(*i as f64),
                _ => self,
            },
        }
    }

    /// Returns true if this is a NULL value.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to extract an integer value.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to extract a float value.
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to extract a text reference.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to extract a blob reference.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Convert to an integer the way `CAST(x AS INTEGER)` does.
    ///
    /// NULL and BLOB become 0; text is parsed, 0 on failure.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_integer(&self) -> i64 {
        match self {
            Self::Null | Self::Blob(_) => 0,
            Self::Integer(i) => *i,
            Self::Float(f) => *f as i64,
            Self::Text(s) => s
                .trim()
                .parse::<i64>()
                .unwrap_or_else(|_| s.trim().parse::<f64>().map_or(0, |f| f as i64)),
        }
    }

    /// Convert to a float the way `CAST(x AS REAL)` does.
    #[allow(clippy::cast_precision_loss)]
    pub fn to_float(&self) -> f64 {
        match self {
            Self::Null | Self::Blob(_) => 0.0,
            Self::Integer(i) => *i as f64,
            Self::Float(f) => *f,
            Self::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        }
    }

    /// Convert to text the way `CAST(x AS TEXT)` does.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Returns the `typeof()` string for this value.
    pub const fn typeof_str(&self) -> &'static str {
        self.storage_class().name()
    }

    /// Byte length for TEXT and BLOB, used by size checks.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Blob(b) => b.len(),
            _ => 0,
        }
    }

    /// NULLs first, then numbers, text, blobs.
    const fn sort_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(_) => 3,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Blob(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Equal))
    }
}

impl PartialOrd for SqlValue {
    #[allow(clippy::cast_precision_loss)]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let class_a = self.sort_class();
        let class_b = other.sort_class();
        if class_a != class_b {
            return Some(class_a.cmp(&class_b));
        }

        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Blob(a), Self::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for SqlValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        Self::Integer(i64::from(b))
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        if f.is_nan() { Self::Null } else { Self::Float(f) }
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Blob(b)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(b: &[u8]) -> Self {
        Self::Blob(b.to_vec())
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// Match `text` against a LIKE pattern.
///
/// `%` matches any run, `_` one character; ASCII letters compare
/// case-insensitively. `escape` makes the following character literal.
pub fn sql_like(pattern: &str, text: &str, escape: Option<char>) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    like_from(&pattern, &text, escape)
}

fn like_from(pattern: &[char], text: &[char], escape: Option<char>) -> bool {
    let (mut pi, mut ti) = (0, 0);
    while pi < pattern.len() {
        let pc = pattern[pi];
        if Some(pc) == escape {
            pi += 1;
            let Some(&literal) = pattern.get(pi) else {
                return false;
            };
            if ti >= text.len() || !literal.eq_ignore_ascii_case(&text[ti]) {
                return false;
            }
            pi += 1;
            ti += 1;
            continue;
        }
        match pc {
            '%' => {
                while pi < pattern.len() && pattern[pi] == '%' {
                    pi += 1;
                }
                if pi >= pattern.len() {
                    return true;
                }
                return (ti..=text.len()).any(|start| like_from(&pattern[pi..], &text[start..], escape));
            }
            '_' => {
                if ti >= text.len() {
                    return false;
                }
            }
            _ => {
                if ti >= text.len() || !pc.eq_ignore_ascii_case(&text[ti]) {
                    return false;
                }
            }
        }
        pi += 1;
        ti += 1;
    }
    ti >= text.len()
}

/// Match `text` against a GLOB pattern (case-sensitive).
///
/// `*` matches any run, `?` one character, `[...]` a character class with
/// ranges and `^` negation.
pub fn sql_glob(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_from(&pattern, &text)
}

fn glob_from(pattern: &[char], text: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    while pi < pattern.len() {
        match pattern[pi] {
            '*' => {
                while pi < pattern.len() && pattern[pi] == '*' {
                    pi += 1;
                }
                if pi >= pattern.len() {
                    return true;
                }
                return (ti..=text.len()).any(|start| glob_from(&pattern[pi..], &text[start..]));
            }
            '?' => {
                if ti >= text.len() {
                    return false;
                }
                pi += 1;
            }
            '[' => {
                let Some(&c) = text.get(ti) else {
                    return false;
                };
                let Some((matched, next)) = glob_class(pattern, pi + 1, c) else {
                    return false;
                };
                if !matched {
                    return false;
                }
                pi = next;
            }
            pc => {
                if text.get(ti) != Some(&pc) {
                    return false;
                }
                pi += 1;
            }
        }
        ti += 1;
    }
    ti >= text.len()
}

/// Evaluate a `[...]` class starting after the `[`; returns the verdict and
/// the index after the closing `]`, or `None` if the class is unterminated.
fn glob_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let pc = pattern[i];
        if pc == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        if pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).is_some_and(|&hi| hi != ']') {
            let hi = pattern[i + 2];
            if (pc..=hi).contains(&c) {
                matched = true;
            }
            i += 3;
        } else {
            if pc == c {
                matched = true;
            }
            i += 1;
        }
        first = false;
    }
    None
}

/// Parse text as INTEGER or REAL if it is a well-formed numeric literal.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn coerce_text_to_numeric(s: &str) -> Option<SqlValue> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(SqlValue::Integer(i));
    }
    let f = trimmed.parse::<f64>().ok()?;
    if !f.is_finite() {
        let lower = trimmed.to_ascii_lowercase();
        if lower.contains("inf") || lower.contains("nan") {
            return None;
        }
    }
    if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&f) {
        let i = f as i64;
        if (i as f64) == f {
            return Some(SqlValue::Integer(i));
        }
    }
    Some(SqlValue::Float(f))
}

/// Format a REAL so it always carries a decimal point (`120.0`, not `120`).
#[must_use]
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_owned();
    }
    if f.is_infinite() {
        return if f.is_sign_positive() { "Inf" } else { "-Inf" }.to_owned();
    }
    let s = format!("{f}");
    if s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_properties() {
        let v = SqlValue::Null;
        assert!(v.is_null());
        assert_eq!(v.to_integer(), 0);
        assert_eq!(v.to_text(), "");
        assert_eq!(v.to_string(), "NULL");
        assert_eq!(v.typeof_str(), "null");
    }

    #[test]
    fn text_numeric_coercion() {
        let v = SqlValue::Text("123".to_owned());
        assert_eq!(v.to_integer(), 123);
        assert_eq!(v.to_float(), 123.0);

        let v = SqlValue::Text("3.5".to_owned());
        assert_eq!(v.to_integer(), 3);
    }

    #[test]
    fn apply_affinity_rules() {
        assert_eq!(
            SqlValue::Text("42".to_owned()).apply_affinity(TypeAffinity::Integer),
            SqlValue::Integer(42)
        );
        assert_eq!(
            SqlValue::Float(3.0).apply_affinity(TypeAffinity::Integer),
            SqlValue::Integer(3)
        );
        assert_eq!(
            SqlValue::Integer(7).apply_affinity(TypeAffinity::Real).as_float(),
            Some(7.0)
        );
        assert_eq!(
            SqlValue::Integer(7).apply_affinity(TypeAffinity::Text),
            SqlValue::Text("7".to_owned())
        );
        assert_eq!(
            SqlValue::Text("abc".to_owned()).apply_affinity(TypeAffinity::Integer),
            SqlValue::Text("abc".to_owned())
        );
        assert_eq!(
            SqlValue::Text("1".to_owned()).apply_affinity(TypeAffinity::None),
            SqlValue::Text("1".to_owned())
        );
        assert_eq!(
            SqlValue::Text("inf".to_owned()).apply_affinity(TypeAffinity::Real),
            SqlValue::Text("inf".to_owned())
        );
    }

    #[test]
    fn display_formatting() {
        assert_eq!(SqlValue::Integer(-1).to_string(), "-1");
        assert_eq!(SqlValue::Float(1.5).to_string(), "1.5");
        assert_eq!(SqlValue::Float(120.0).to_string(), "120.0");
        assert_eq!(SqlValue::Text("it's".to_owned()).to_string(), "'it''s'");
        assert_eq!(SqlValue::Blob(vec![0xCA, 0xFE]).to_string(), "X'CAFE'");
    }

    #[test]
    fn sort_order_null_first() {
        let null = SqlValue::Null;
        let int = SqlValue::Integer(0);
        let text = SqlValue::Text(String::new());
        let blob = SqlValue::Blob(vec![]);

        assert!(null < int);
        assert!(int < text);
        assert!(text < blob);
        assert_eq!(SqlValue::Integer(3), SqlValue::Float(3.0));
    }

    #[test]
    fn from_conversions() {
        assert_eq!(SqlValue::from(42i32).as_integer(), Some(42));
        assert_eq!(SqlValue::from(true).as_integer(), Some(1));
        assert!(SqlValue::from(f64::NAN).is_null());
        assert_eq!(SqlValue::from("hi").as_text(), Some("hi"));
        assert_eq!(SqlValue::from(vec![1u8]).as_blob(), Some(&[1u8][..]));
        assert!(SqlValue::from(None::<i64>).is_null());
    }

    #[test]
    fn like_patterns() {
        assert!(sql_like("he%", "Hello", None));
        assert!(sql_like("h_llo", "HELLO", None));
        assert!(sql_like("%", "", None));
        assert!(!sql_like("h_llo", "hllo", None));
        assert!(sql_like("100\\%", "100%", Some('\\')));
        assert!(!sql_like("100\\%", "1000", Some('\\')));
    }

    #[test]
    fn glob_patterns() {
        assert!(sql_glob("he*", "hello"));
        assert!(!sql_glob("he*", "Hello"));
        assert!(sql_glob("h?llo", "hallo"));
        assert!(sql_glob("[a-c]x", "bx"));
        assert!(!sql_glob("[^a-c]x", "bx"));
        assert!(sql_glob("[]]", "]"));
        assert!(!sql_glob("[abc", "a"));
    }

    #[test]
    fn serde_keeps_storage_class() {
        let v = SqlValue::Blob(vec![1, 2, 3]);
        let json = serde_json::to_string(&v).unwrap();
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.storage_class(), StorageClass::Blob);
        assert_eq!(back, v);
    }

    fn any_value() -> impl Strategy<Value = SqlValue> {
        prop_oneof![
            Just(SqlValue::Null),
            any::<i64>().prop_map(SqlValue::Integer),
            (-1e6_f64..1e6).prop_map(SqlValue::Float),
            "[a-c]{0,3}".prop_map(SqlValue::Text),
            prop::collection::vec(any::<u8>(), 0..3).prop_map(SqlValue::Blob),
        ]
    }

    proptest! {
        #[test]
        fn prop_sort_order_is_antisymmetric(a in any_value(), b in any_value()) {
            let ab = a.partial_cmp(&b);
            let ba = b.partial_cmp(&a);
            prop_assert!(ab.is_some());
            prop_assert_eq!(ab, ba.map(Ordering::reverse));
        }

        #[test]
        fn prop_text_affinity_is_idempotent(v in any_value()) {
            let once = v.apply_affinity(TypeAffinity::Text);
            let twice = once.clone().apply_affinity(TypeAffinity::Text);
            prop_assert_eq!(once.storage_class(), twice.storage_class());
            prop_assert_eq!(once, twice);
        }
    }
}
