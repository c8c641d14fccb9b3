//! PostgreSQL Ledger Store
//!
//! One sqlx transaction per unit of work. Row locks are `SELECT ... FOR UPDATE`
//! taken one account at a time in ascending `account_id` order, so two
//! transfers sharing accounts always queue in the same order.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};

use super::{LedgerStore, UnitOfWork};
use crate::transfer::error::StoreError;
use crate::transfer::types::{
    Account, AccountId, AccountKind, NewTransaction, Transaction, TransactionId,
};

const ACCOUNT_COLUMNS: &str = "account_id, kind, owner_ref, balance, created_at";
const TRANSACTION_COLUMNS: &str =
    "transaction_id, cid, sender_account_id, receiver_account_id, amount, created_at";

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let kind_id: i16 = row.try_get("kind")?;
    let kind = AccountKind::from_id(kind_id)
        .ok_or_else(|| StoreError::Other(format!("unknown account kind {}", kind_id)))?;
    let id: String = row.try_get("account_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Account {
        id: AccountId::new(id),
        kind,
        owner_ref: row.try_get("owner_ref")?,
        balance: row.try_get("balance")?,
        created_at,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let raw_id: String = row.try_get("transaction_id")?;
    let transaction_id: TransactionId = raw_id
        .parse()
        .map_err(|e| StoreError::Other(format!("bad transaction_id {}: {}", raw_id, e)))?;
    let sender: String = row.try_get("sender_account_id")?;
    let receiver: String = row.try_get("receiver_account_id")?;

    Ok(Transaction {
        transaction_id,
        cid: row.try_get("cid")?,
        sender_account_id: AccountId::new(sender),
        receiver_account_id: AccountId::new(receiver),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(
        &self,
        lock_timeout: Option<Duration>,
    ) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(limit) = lock_timeout {
            // 0 would mean "wait forever"
            let ms = limit.as_millis().max(1);
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", ms))
                .execute(&mut *tx)
                .await?;
        }

        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts_tb WHERE account_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn fetch_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions_tb WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }
}

struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let sql = format!(
            "SELECT {} FROM accounts_tb WHERE account_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        );

        let mut accounts = Vec::with_capacity(ordered.len());
        for id in &ordered {
            let row = sqlx::query(&sql)
                .bind(id.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;
            if let Some(row) = row {
                accounts.push(account_from_row(&row)?);
            }
        }
        Ok(accounts)
    }

    async fn find_by_cid(&mut self, cid: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions_tb WHERE cid = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(cid)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn apply_delta(&mut self, id: &AccountId, delta: i64) -> Result<i64, StoreError> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts_tb SET balance = balance + $1 WHERE account_id = $2 RETURNING balance",
        )
        .bind(delta)
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        balance.ok_or_else(|| StoreError::RowNotFound(format!("account {}", id)))
    }

    async fn insert_transaction(
        &mut self,
        tx: &NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO transactions_tb
                (transaction_id, cid, sender_account_id, receiver_account_id, amount)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(tx.transaction_id.to_string())
        .bind(tx.cid.as_deref())
        .bind(tx.sender_account_id.as_str())
        .bind(tx.receiver_account_id.as_str())
        .bind(tx.amount)
        .fetch_one(&mut *self.tx)
        .await?;

        transaction_from_row(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
