//! Result codes and the error taxonomy shared by every vtbridge crate.
//!
//! The engine speaks in numeric result codes; Rust callers speak in
//! [`BridgeError`]. Every variant maps onto an [`ExtendedCode`] so the
//! dispatcher can hand a status plus message back across the protocol
//! boundary.

use thiserror::Error;

/// Which declared constraint a mutation violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Generic virtual-table constraint (`SQLITE_CONSTRAINT_VTAB`).
    Vtab,
    /// A NOT NULL column received NULL.
    NotNull,
    /// The PRIMARY KEY column was missing or malformed.
    PrimaryKey,
    /// A duplicate key or rowid.
    Unique,
    /// A CHECK-style rule (size limits and the like).
    Check,
    /// The value's storage class does not fit the declared column type.
    DataType,
    /// The column or table refuses writes.
    ReadOnly,
}

impl ConstraintKind {
    /// The label used in error messages.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Vtab => "VTAB",
            Self::NotNull => "NOT NULL",
            Self::PrimaryKey => "PRIMARY KEY",
            Self::Unique => "UNIQUE",
            Self::Check => "CHECK",
            Self::DataType => "DATATYPE",
            Self::ReadOnly => "READONLY",
        }
    }

    /// The extended result code reported to the engine.
    pub const fn extended_code(self) -> ExtendedCode {
        match self {
            Self::Vtab | Self::ReadOnly => ExtendedCode::CONSTRAINT_VTAB,
            Self::NotNull => ExtendedCode::CONSTRAINT_NOTNULL,
            Self::PrimaryKey => ExtendedCode::CONSTRAINT_PRIMARYKEY,
            Self::Unique => ExtendedCode::CONSTRAINT_UNIQUE,
            Self::Check => ExtendedCode::CONSTRAINT_CHECK,
            Self::DataType => ExtendedCode::CONSTRAINT_DATATYPE,
        }
    }
}

/// Primary error type for virtual table operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    // === Constraint Errors ===
    /// A mutation violated a declared constraint. Recoverable by the caller.
    #[error("{} constraint failed: {detail}", kind.label())]
    Constraint { kind: ConstraintKind, detail: String },

    // === BUSY / LOCKED ===
    /// The backing store is busy.
    #[error("database is busy")]
    Busy,

    /// The backing store is busy due to recovery.
    #[error("database is busy (recovery in progress)")]
    BusyRecovery,

    /// A table-level lock is held elsewhere.
    #[error("database table is locked: {name}")]
    Locked { name: String },

    // === Resource Errors ===
    /// Allocation failed inside a callback.
    #[error("out of memory")]
    OutOfMemory,

    /// String or BLOB exceeds a size limit.
    #[error("string or BLOB exceeds size limit")]
    TooBig,

    // === Protocol Errors ===
    /// The protocol was driven out of order (column before filter, etc.).
    #[error("bad parameter or other API misuse: {detail}")]
    Misuse { detail: String },

    /// A callback panicked; the panic was caught at the dispatch boundary.
    #[error("virtual table callback panicked: {0}")]
    Panic(String),

    /// The statement was interrupted.
    #[error("interrupted")]
    Interrupt,

    // === Schema Errors ===
    /// The declared schema is malformed.
    #[error("vtable constructor failed: {detail}")]
    Schema { detail: String },

    /// No module is registered under this name.
    #[error("no such module: {name}")]
    NoSuchModule { name: String },

    /// No table instance exists under this name.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    /// A table instance already exists under this name.
    #[error("table {name} already exists")]
    TableExists { name: String },

    // === Type Errors ===
    /// Type mismatch in a typed column accessor.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // === Capability Errors ===
    /// Attempt to write a read-only virtual table.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// The module does not implement this operation.
    #[error("unsupported operation")]
    Unsupported,

    // === Internal Errors ===
    /// Internal logic error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Generic failure carrying a message.
    #[error("{0}")]
    Error(String),
}

/// Primary SQLite result codes.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Table is locked.
    Locked = 6,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Not found (internal).
    NotFound = 12,
    /// Database or disk is full.
    Full = 13,
    /// Unable to open database file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// (Not used).
    Empty = 16,
    /// Database schema has changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
    /// Authorization denied.
    Auth = 23,
    /// Not used.
    Format = 24,
    /// Bind parameter out of range.
    Range = 25,
    /// Not a database file.
    NotADb = 26,
    /// Notification (not an error).
    Notice = 27,
    /// Warning (not an error).
    Warning = 28,
    /// A row is available.
    Row = 100,
    /// Execution has finished.
    Done = 101,
}

impl ErrorCode {
    /// Decode a primary code. Extended bits must already be stripped.
    pub const fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            16 => Self::Empty,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            22 => Self::NoLfs,
            23 => Self::Auth,
            24 => Self::Format,
            25 => Self::Range,
            26 => Self::NotADb,
            27 => Self::Notice,
            28 => Self::Warning,
            100 => Self::Row,
            101 => Self::Done,
            _ => return None,
        })
    }

    /// Ok, Row, and Done are not failures.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Row | Self::Done)
    }
}

/// An extended result code: the primary code in the low byte, a
/// sub-code in the bits above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedCode(pub i32);

impl ExtendedCode {
    const fn with_sub(primary: ErrorCode, sub: i32) -> Self {
        Self(primary as i32 | (sub << 8))
    }

    pub const OK: Self = Self(ErrorCode::Ok as i32);
    pub const ERROR: Self = Self(ErrorCode::Error as i32);
    pub const ERROR_MISSING_COLLSEQ: Self = Self::with_sub(ErrorCode::Error, 1);
    pub const INTERNAL: Self = Self(ErrorCode::Internal as i32);
    pub const BUSY: Self = Self(ErrorCode::Busy as i32);
    pub const BUSY_RECOVERY: Self = Self::with_sub(ErrorCode::Busy, 1);
    pub const BUSY_SNAPSHOT: Self = Self::with_sub(ErrorCode::Busy, 2);
    pub const LOCKED: Self = Self(ErrorCode::Locked as i32);
    pub const LOCKED_VTAB: Self = Self::with_sub(ErrorCode::Locked, 2);
    pub const NOMEM: Self = Self(ErrorCode::NoMem as i32);
    pub const READONLY: Self = Self(ErrorCode::ReadOnly as i32);
    pub const READONLY_ROLLBACK: Self = Self::with_sub(ErrorCode::ReadOnly, 3);
    pub const INTERRUPT: Self = Self(ErrorCode::Interrupt as i32);
    pub const IOERR_NOMEM: Self = Self::with_sub(ErrorCode::IoErr, 12);
    pub const SCHEMA: Self = Self(ErrorCode::Schema as i32);
    pub const TOOBIG: Self = Self(ErrorCode::TooBig as i32);
    pub const CONSTRAINT: Self = Self(ErrorCode::Constraint as i32);
    pub const CONSTRAINT_CHECK: Self = Self::with_sub(ErrorCode::Constraint, 1);
    pub const CONSTRAINT_NOTNULL: Self = Self::with_sub(ErrorCode::Constraint, 5);
    pub const CONSTRAINT_PRIMARYKEY: Self = Self::with_sub(ErrorCode::Constraint, 6);
    pub const CONSTRAINT_UNIQUE: Self = Self::with_sub(ErrorCode::Constraint, 8);
    pub const CONSTRAINT_VTAB: Self = Self::with_sub(ErrorCode::Constraint, 9);
    pub const CONSTRAINT_DATATYPE: Self = Self::with_sub(ErrorCode::Constraint, 12);
    pub const MISMATCH: Self = Self(ErrorCode::Mismatch as i32);
    pub const MISUSE: Self = Self(ErrorCode::Misuse as i32);
    pub const NOLFS: Self = Self(ErrorCode::NoLfs as i32);

    /// The primary code in the low byte.
    pub const fn primary(self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.0 & 0xff)
    }

    /// The sub-code above the low byte (0 for plain primary codes).
    pub const fn sub_code(self) -> i32 {
        self.0 >> 8
    }
}

impl From<ErrorCode> for ExtendedCode {
    fn from(code: ErrorCode) -> Self {
        Self(code as i32)
    }
}

/// The discriminated result of one engine step or callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    Row,
    Done,
    Error(ExtendedCode),
}

impl StepResult {
    /// The raw integer the engine sees.
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => ErrorCode::Ok as i32,
            Self::Row => ErrorCode::Row as i32,
            Self::Done => ErrorCode::Done as i32,
            Self::Error(code) => code.0,
        }
    }

    /// Decode a raw result code.
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            100 => Self::Row,
            101 => Self::Done,
            other => Self::Error(ExtendedCode(other)),
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl<T> From<&Result<T>> for StepResult {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => Self::Error(err.extended_code()),
        }
    }
}

impl BridgeError {
    /// Map this error to its extended result code.
    #[allow(clippy::match_same_arms)]
    pub const fn extended_code(&self) -> ExtendedCode {
        match self {
            Self::Constraint { kind, .. } => kind.extended_code(),
            Self::Busy => ExtendedCode::BUSY,
            Self::BusyRecovery => ExtendedCode::BUSY_RECOVERY,
            Self::Locked { .. } => ExtendedCode::LOCKED_VTAB,
            Self::OutOfMemory => ExtendedCode::NOMEM,
            Self::TooBig => ExtendedCode::TOOBIG,
            Self::Misuse { .. } => ExtendedCode::MISUSE,
            Self::Panic(_) | Self::Internal(_) => ExtendedCode::INTERNAL,
            Self::Interrupt => ExtendedCode::INTERRUPT,
            Self::Schema { .. } => ExtendedCode::ERROR,
            Self::NoSuchModule { .. } | Self::NoSuchTable { .. } | Self::TableExists { .. } => {
                ExtendedCode::ERROR
            }
            Self::TypeMismatch { .. } => ExtendedCode::MISMATCH,
            Self::ReadOnly => ExtendedCode::READONLY,
            Self::Unsupported => ExtendedCode::NOLFS,
            Self::Error(_) => ExtendedCode::ERROR,
        }
    }

    /// The primary result code.
    pub const fn error_code(&self) -> ErrorCode {
        match self.extended_code().primary() {
            Some(code) => code,
            None => ErrorCode::Error,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::BusyRecovery | Self::Locked { .. })
    }

    /// Whether this is a recoverable constraint violation.
    pub const fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    /// Whether this error signals a broken calling sequence.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Misuse { .. } | Self::Panic(_))
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy | Self::BusyRecovery | Self::Locked { .. } => {
                Some("Retry the operation after a short delay")
            }
            Self::Constraint { .. } => Some("Retry the statement with different values"),
            Self::ReadOnly => Some("Register the module with update support"),
            Self::NoSuchModule { .. } => Some("Register the module before creating tables"),
            _ => None,
        }
    }

    /// Create a constraint violation.
    pub fn constraint(kind: ConstraintKind, detail: impl Into<String>) -> Self {
        Self::Constraint {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a protocol misuse error.
    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::Misuse {
            detail: detail.into(),
        }
    }

    /// Create a schema declaration error.
    pub fn schema(detail: impl Into<String>) -> Self {
        Self::Schema {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a generic failure carrying a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }
}

/// Result type alias using `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
