//! Error types for the Basalt engine core
//!
//! Defines a unified error type that can represent errors from all components.
//! Error messages and codes are formatted to be MySQL-compatible so the query
//! layer can pass them through to client drivers unchanged.

use std::fmt;
use std::io;

/// Unified error type for engine operations
#[derive(Debug)]
pub enum EngineError {
    /// I/O error (XA log, checkpoint marker)
    Io(io::Error),
    /// Transaction was marked for forced rollback by the deadlock resolver.
    /// The caller must initiate a full rollback; the engine never retries.
    ForcedAbort,
    /// The deadlock resolver chose this transaction as victim after a wait.
    /// Always rolls back the whole transaction.
    Deadlock,
    /// Lock acquisition exceeded the configured wait bound. By default only
    /// the current statement is rolled back (see `Config::rollback_on_timeout`).
    LockWaitTimeout,
    /// Named savepoint does not exist. Transaction state is unaffected.
    NoSuchSavepoint(String),
    /// The admission gate could not grant entry in bounded time. Only
    /// background/low-priority callers see this; they should back off and retry.
    EngineBusy,
    /// The session was killed while waiting inside the engine
    Interrupted,
    /// The auto-increment counter for a table has reached its maximum value
    AutoincExhausted(String),
    /// Operation invalid for the transaction's current state
    Transaction(String),
    /// Generic internal error
    Internal(String),
}

impl EngineError {
    /// Create an "operation invalid in state" error
    pub fn invalid_state(op: &str, state: impl fmt::Display) -> Self {
        EngineError::Transaction(format!("Cannot {} a transaction in state {}", op, state))
    }

    /// Create a MySQL-compatible "no such savepoint" error
    /// MySQL format: SAVEPOINT name does not exist
    pub fn no_such_savepoint(name: &str) -> Self {
        EngineError::NoSuchSavepoint(name.to_string())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // MySQL-compatible error messages: display the message directly
        // without prefixing with error type (clients already know the type
        // from the error code)
        match self {
            EngineError::Io(e) => write!(f, "{}", e),
            EngineError::ForcedAbort => {
                write!(f, "Deadlock found when trying to get lock; try restarting transaction")
            }
            EngineError::Deadlock => {
                write!(f, "Deadlock found when trying to get lock; try restarting transaction")
            }
            EngineError::LockWaitTimeout => {
                write!(f, "Lock wait timeout exceeded; try restarting transaction")
            }
            EngineError::NoSuchSavepoint(name) => {
                write!(f, "SAVEPOINT {} does not exist", name)
            }
            EngineError::EngineBusy => {
                write!(f, "Too many active concurrent transactions")
            }
            EngineError::Interrupted => write!(f, "Query execution was interrupted"),
            EngineError::AutoincExhausted(table) => {
                write!(
                    f,
                    "Failed to read auto-increment value from storage engine for table '{}'",
                    table
                )
            }
            EngineError::Transaction(msg) => write!(f, "{}", msg),
            EngineError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// MySQL error codes (subset for our implementation)
pub mod mysql_error_codes {
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_SP_DOES_NOT_EXIST: u16 = 1305;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_AUTOINC_READ_FAILED: u16 = 1467;
    pub const ER_TOO_MANY_CONCURRENT_TRXS: u16 = 1637;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
}

impl EngineError {
    /// Get the MySQL error code for this error.
    ///
    /// `ForcedAbort` deliberately maps to the same code as `Deadlock`: from
    /// the client's perspective the effect (transaction lost, must retry)
    /// is identical.
    pub fn mysql_error_code(&self) -> u16 {
        match self {
            EngineError::ForcedAbort => mysql_error_codes::ER_LOCK_DEADLOCK,
            EngineError::Deadlock => mysql_error_codes::ER_LOCK_DEADLOCK,
            EngineError::LockWaitTimeout => mysql_error_codes::ER_LOCK_WAIT_TIMEOUT,
            EngineError::NoSuchSavepoint(_) => mysql_error_codes::ER_SP_DOES_NOT_EXIST,
            EngineError::Interrupted => mysql_error_codes::ER_QUERY_INTERRUPTED,
            EngineError::AutoincExhausted(_) => mysql_error_codes::ER_AUTOINC_READ_FAILED,
            EngineError::EngineBusy => mysql_error_codes::ER_TOO_MANY_CONCURRENT_TRXS,
            _ => mysql_error_codes::ER_UNKNOWN_ERROR,
        }
    }

    /// Get the SQLSTATE for this error
    pub fn sql_state(&self) -> &'static str {
        match self {
            EngineError::ForcedAbort | EngineError::Deadlock => "40001",
            EngineError::LockWaitTimeout => "HY000",
            EngineError::NoSuchSavepoint(_) => "42000",
            EngineError::Interrupted => "70100",
            _ => "HY000",
        }
    }

    /// Whether a client driver can retry the whole transaction after
    /// receiving this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ForcedAbort
                | EngineError::Deadlock
                | EngineError::LockWaitTimeout
                | EngineError::EngineBusy
        )
    }
}
