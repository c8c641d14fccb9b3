//! Payment Ledger - atomic customer -> merchant transfers
//!
//! # Modules
//!
//! - [`transfer`] - Transfer engine, ledger stores, account resolution
//! - [`db`] - PostgreSQL pool and schema bootstrap
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use transfer::{
    Account, AccountId, AccountKind, EngineConfig, PaymentRequest, PaymentService, Transaction,
    TransactionId, TransferEngine, TransferError, TransferRequest,
};
