//! Customer -> Merchant Transfers
//!
//! Moves funds from a customer account to a merchant account as one atomic
//! unit: validate, debit, credit and record, or nothing at all.
//!
//! # Layout
//!
//! - [`engine::TransferEngine`] orchestrates a transfer against a
//!   [`store::LedgerStore`]
//! - [`validation`] holds the pure balance checks
//! - [`resolver`] maps callers and merchant references to accounts
//! - [`service::PaymentService`] puts resolver and engine together
//!
//! # Safety Invariants
//!
//! 1. **All-or-nothing**: debit, credit and record commit together or not at all
//! 2. **Lock order**: accounts are always locked in ascending id order
//! 3. **Validate under lock**: the balance check and the debit see the same row
//! 4. **Conservation**: every committed debit has an equal credit and one record

pub mod engine;
pub mod error;
pub mod resolver;
pub mod service;
pub mod state;
pub mod store;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use engine::{EngineConfig, TransferEngine};
pub use error::{ErrorClass, StoreError, TransferError};
pub use resolver::{AccountResolver, PgAccountResolver, StaticResolver};
pub use service::{PaymentRequest, PaymentService};
pub use state::TransferState;
pub use store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore, UnitOfWork};
pub use types::{Account, AccountId, AccountKind, Transaction, TransactionId, TransferRequest};
