//! Account Resolution
//!
//! Maps an authenticated user to their customer account and a merchant
//! reference to its merchant account. The engine itself only ever sees
//! canonical [`AccountId`]s.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use super::error::TransferError;
use super::types::{AccountId, AccountKind};

#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// Customer account owned by `user_id`
    async fn customer_account_for_user(&self, user_id: &str) -> Result<AccountId, TransferError>;

    /// Merchant account registered under `merchant_ref`
    async fn merchant_account(&self, merchant_ref: &str) -> Result<AccountId, TransferError>;
}

/// Resolves through `accounts_tb.owner_ref`
pub struct PgAccountResolver {
    pool: PgPool,
}

impl PgAccountResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lookup(&self, kind: AccountKind, owner_ref: &str) -> Result<AccountId, TransferError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT account_id FROM accounts_tb WHERE kind = $1 AND owner_ref = $2
             ORDER BY account_id LIMIT 1",
        )
        .bind(kind.id())
        .bind(owner_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TransferError::Persistence(e.into()))?;

        id.map(AccountId::new).ok_or_else(|| {
            TransferError::AccountNotFound(format!("{} {}", kind.as_str().to_lowercase(), owner_ref))
        })
    }
}

#[async_trait]
impl AccountResolver for PgAccountResolver {
    async fn customer_account_for_user(&self, user_id: &str) -> Result<AccountId, TransferError> {
        self.lookup(AccountKind::Customer, user_id).await
    }

    async fn merchant_account(&self, merchant_ref: &str) -> Result<AccountId, TransferError> {
        self.lookup(AccountKind::Merchant, merchant_ref).await
    }
}

/// Map-backed resolver for tests and tooling
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    customers: HashMap<String, AccountId>,
    merchants: HashMap<String, AccountId>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, user_id: impl Into<String>, account: impl Into<AccountId>) -> Self {
        self.customers.insert(user_id.into(), account.into());
        self
    }

    pub fn with_merchant(
        mut self,
        merchant_ref: impl Into<String>,
        account: impl Into<AccountId>,
    ) -> Self {
        self.merchants.insert(merchant_ref.into(), account.into());
        self
    }
}

#[async_trait]
impl AccountResolver for StaticResolver {
    async fn customer_account_for_user(&self, user_id: &str) -> Result<AccountId, TransferError> {
        self.customers
            .get(user_id)
            .cloned()
            .ok_or_else(|| TransferError::AccountNotFound(format!("customer {}", user_id)))
    }

    async fn merchant_account(&self, merchant_ref: &str) -> Result<AccountId, TransferError> {
        self.merchants
            .get(merchant_ref)
            .cloned()
            .ok_or_else(|| TransferError::AccountNotFound(format!("merchant {}", merchant_ref)))
    }
}
