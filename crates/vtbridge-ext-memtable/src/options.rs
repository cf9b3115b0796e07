//! `key=value` table options.

use vtbridge_error::{BridgeError, Result};

/// Options accepted in `CREATE VIRTUAL TABLE t USING memtable(...)`.
///
/// Any argument whose left side is a bare option name is an option;
/// everything else is a column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTableOptions {
    /// Reject every write.
    pub read_only: bool,
    /// Reject values whose storage class does not fit the column's declared
    /// type (after the usual affinity conversion).
    pub strict: bool,
    /// Largest TEXT or BLOB accepted, in bytes. `0` disables the check.
    pub max_value_len: usize,
    /// Make `sync` fail. Used to exercise two-phase commit rollback.
    pub fail_sync: bool,
    /// Declare the table `WITHOUT ROWID`; rows are addressed by their
    /// PRIMARY KEY.
    pub without_rowid: bool,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            strict: false,
            max_value_len: 1_000_000,
            fail_sync: false,
            without_rowid: false,
        }
    }
}

fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn is_option_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl MemTableOptions {
    /// Apply one `key=value` argument. Returns `Ok(false)` when `arg` is not
    /// an option at all.
    pub fn apply(&mut self, arg: &str) -> Result<bool> {
        let Some((raw_key, raw_value)) = arg.trim().split_once('=') else {
            return Ok(false);
        };
        let key = raw_key.trim().to_ascii_lowercase();
        if !is_option_key(&key) {
            return Ok(false);
        }
        let bad_value = || BridgeError::message(format!("memtable: bad value for {key}: {raw_value}"));
        match key.as_str() {
            "read_only" | "readonly" => self.read_only = parse_bool_like(raw_value).ok_or_else(bad_value)?,
            "strict" => self.strict = parse_bool_like(raw_value).ok_or_else(bad_value)?,
            "fail_sync" => self.fail_sync = parse_bool_like(raw_value).ok_or_else(bad_value)?,
            "without_rowid" => {
                self.without_rowid = parse_bool_like(raw_value).ok_or_else(bad_value)?;
            }
            "max_value_len" => {
                self.max_value_len = raw_value.trim().parse().map_err(|_| bad_value())?;
            }
            _ => {
                return Err(BridgeError::message(format!(
                    "memtable: unrecognized option {key}"
                )));
            }
        }
        Ok(true)
    }

    /// Split module arguments into options and column definitions.
    pub fn parse<'a>(args: &[&'a str]) -> Result<(Self, Vec<&'a str>)> {
        let mut options = Self::default();
        let mut columns = Vec::new();
        for &arg in args {
            if !options.apply(arg)? {
                columns.push(arg);
            }
        }
        Ok((options, columns))
    }
}
