//! Ledger Stores
//!
//! The transactional persistence contract the transfer engine runs against,
//! and its PostgreSQL and in-memory implementations.
//!
//! # Contract
//!
//! - A [`UnitOfWork`] is the only transaction boundary. Nothing inside it is
//!   visible to other readers until [`UnitOfWork::commit`] returns `Ok`.
//! - Dropping a unit of work without committing is a rollback: staged writes
//!   are discarded and row locks released.
//! - [`UnitOfWork::lock_accounts`] acquires row locks in ascending
//!   [`AccountId`] order whatever the argument order.
//! - [`UnitOfWork::apply_delta`] is a relative update and reports a missing
//!   row as an error instead of silently affecting zero rows.

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, InMemoryLedgerStore, LedgerSnapshot};
pub use postgres::PgLedgerStore;

use std::time::Duration;

use async_trait::async_trait;

use super::error::StoreError;
use super::types::{Account, AccountId, NewTransaction, Transaction, TransactionId};

/// Store handle shared by all transfers
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get store name for logging
    fn name(&self) -> &'static str;

    /// Open a unit of work
    ///
    /// `lock_timeout` bounds how long any single row lock may be waited on.
    async fn begin(&self, lock_timeout: Option<Duration>)
    -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Committed state of one account (read path, takes no lock)
    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    /// Committed transaction by id
    async fn fetch_transaction(&self, id: TransactionId)
    -> Result<Option<Transaction>, StoreError>;
}

/// One atomic group of reads and writes
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock the given accounts for the rest of the unit of work
    ///
    /// Returns only the accounts that exist, in lock order. Already-held
    /// locks are not re-acquired.
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    /// Committed transaction carrying this client idempotency key
    async fn find_by_cid(&mut self, cid: &str) -> Result<Option<Transaction>, StoreError>;

    /// `balance = balance + delta`; returns the new balance
    async fn apply_delta(&mut self, id: &AccountId, delta: i64) -> Result<i64, StoreError>;

    /// Append a transaction record; the store assigns `created_at`
    async fn insert_transaction(&mut self, tx: &NewTransaction)
    -> Result<Transaction, StoreError>;

    /// Make every staged change durable at once
    ///
    /// On `Err` nothing was applied.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every staged change and release locks
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
