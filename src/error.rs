// Error taxonomy for the ledger integrity core

use thiserror::Error;

use crate::audit::IntegrityViolation;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Store error (SQLite)
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A reconciliation check found conflicting rows. Never auto-repaired,
    /// always surfaced to an operator.
    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    /// A migration statement failed and the failure policy did not allow
    /// continuing.
    #[error("migration #{number} failed: {message}")]
    Migration { number: i64, message: String },

    /// The operator (or policy) refused to confirm a failed migration as
    /// already applied.
    #[error("migration #{number} aborted by operator")]
    MigrationAborted { number: i64 },

    /// Non-blocking lock acquisition lost the race. The caller must not
    /// enter the critical section.
    #[error("failed to acquire the {0} lock")]
    LockUnavailable(&'static str),

    /// No rate-limiting rule is configured for this key prefix.
    #[error("no rate limit configured for prefix {0:?}")]
    UnknownRatePrefix(String),

    /// Refused to interpolate a table name that is not a bare identifier.
    #[error("invalid table name: {0:?}")]
    BadTableName(String),
}
