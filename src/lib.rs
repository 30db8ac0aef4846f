// Ledger Audit - Core Library
// Exposes all modules for use in the CLI and in tests

pub mod audit;
pub mod db;
pub mod error;
pub mod lock;
pub mod migrations;
pub mod model;
pub mod rate_limit;
pub mod row;

// Re-export commonly used types
pub use audit::{AuditOutcome, IntegrityViolation, LedgerAuditor};
pub use db::Db;
pub use error::{Error, Result};
pub use lock::{DbLock, LockGuard, LockManager, LockMode};
pub use migrations::{current_version, FailurePolicy, Migration, MigrationRunner};
pub use model::{
    CashBundle, Exchange, ExchangeEvent, ExchangeStatus, Payin, PayinTransfer, Tip,
    Transfer, TransferStatus, Wallet,
};
pub use rate_limit::{HitOutcome, RateLimiter, RateRule};
pub use row::{render, show_table, Row, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
