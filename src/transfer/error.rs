//! Transfer Error Types
//!
//! Usage, business-rule and infrastructure errors for the transfer engine,
//! plus the store-level error every ledger adapter reports.

use std::time::Duration;

use thiserror::Error;

use super::state::TransferState;
use super::validation::ValidationError;

/// Error class, used by callers to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; never retried automatically
    Usage,
    /// Normal negative outcome (e.g. insufficient funds)
    BusinessRule,
    /// Store or deadline failure; fully rolled back, safe to retry
    Infrastructure,
    /// Engine bug; rolled back, not retried
    Internal,
}

/// Ledger store errors
///
/// Reported by `LedgerStore` / `UnitOfWork` implementations. Whenever one of
/// these surfaces, the unit of work has not been committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization conflict: {0}")]
    Conflict(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Lock or statement timeout: {0}")]
    LockTimeout(String),

    #[error("Row not found: {0}")]
    RowNotFound(String),

    #[error("Injected fault at {0}")]
    Fault(String),

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// True for a unique violation on the client idempotency key
    pub fn is_duplicate_cid(&self) -> bool {
        matches!(self, StoreError::Constraint(msg) if msg.contains("cid"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                let detail = match db.constraint() {
                    Some(constraint) => format!("{} ({})", db.message(), constraint),
                    None => db.message().to_string(),
                };
                match code.as_str() {
                    // serialization_failure, deadlock_detected
                    "40001" | "40P01" => StoreError::Conflict(detail),
                    // lock_not_available, query_canceled
                    "55P03" | "57014" => StoreError::LockTimeout(detail),
                    c if c.starts_with("23") => StoreError::Constraint(detail),
                    // connection exceptions, admin shutdown
                    c if c.starts_with("08") || c.starts_with("57P") => {
                        StoreError::Unavailable(detail)
                    }
                    _ => StoreError::Other(detail),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::RowNotFound => StoreError::RowNotFound(e.to_string()),
            _ => StoreError::Other(e.to_string()),
        }
    }
}

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Usage Errors ===
    #[error("Amount must be greater than zero (got {0})")]
    InvalidAmount(i64),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Sender and receiver account cannot be the same")]
    SameAccount,

    #[error("Account {account} is a {actual} account, expected {expected}")]
    AccountKindMismatch {
        account: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Duplicate request (cid {0} already used for a different transfer)")]
    DuplicateRequest(String),

    // === Business-Rule Errors ===
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Balance would overflow for account {0}")]
    BalanceOverflow(String),

    // === Infrastructure Errors ===
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: TransferState,
        to: TransferState,
    },
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::AccountKindMismatch { .. } => "ACCOUNT_KIND_MISMATCH",
            TransferError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            TransferError::Persistence(_) => "PERSISTENCE_ERROR",
            TransferError::Timeout(_) => "TIMEOUT",
            TransferError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidAmount(_)
            | TransferError::SameAccount
            | TransferError::AccountKindMismatch { .. } => 400,
            TransferError::AccountNotFound(_) => 404,
            TransferError::DuplicateRequest(_) => 409,
            TransferError::InsufficientFunds { .. } | TransferError::BalanceOverflow(_) => 422,
            TransferError::Persistence(StoreError::Conflict(_)) => 409,
            TransferError::Persistence(StoreError::Unavailable(_)) => 503,
            TransferError::Timeout(_) => 504,
            TransferError::Persistence(_) | TransferError::InvalidStateTransition { .. } => 500,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::InvalidAmount(_)
            | TransferError::AccountNotFound(_)
            | TransferError::SameAccount
            | TransferError::AccountKindMismatch { .. }
            | TransferError::DuplicateRequest(_) => ErrorClass::Usage,
            TransferError::InsufficientFunds { .. } | TransferError::BalanceOverflow(_) => {
                ErrorClass::BusinessRule
            }
            TransferError::Persistence(_) | TransferError::Timeout(_) => {
                ErrorClass::Infrastructure
            }
            TransferError::InvalidStateTransition { .. } => ErrorClass::Internal,
        }
    }

    /// Infrastructure failures leave no partial state and may be retried
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }
}

impl From<ValidationError> for TransferError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::InvalidAmount(amount) => TransferError::InvalidAmount(amount),
            ValidationError::InsufficientFunds {
                required,
                available,
            } => TransferError::InsufficientFunds {
                required,
                available,
            },
            ValidationError::BalanceOverflow { account } => TransferError::BalanceOverflow(account),
        }
    }
}
