//! Database connection management

pub mod schema;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Ledger totals: (customer balance sum, merchant balance sum, transaction amount sum)
    pub async fn ledger_totals(&self) -> Result<(i64, i64, i64), sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COALESCE(SUM(balance), 0)::BIGINT FROM accounts_tb WHERE kind = 1) AS customer_total,
                (SELECT COALESCE(SUM(balance), 0)::BIGINT FROM accounts_tb WHERE kind = 2) AS merchant_total,
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM transactions_tb) AS transferred_total
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let customer: i64 = row.try_get_log("customer_total").unwrap_or(0); // SAFE_DEFAULT: empty ledger
        let merchant: i64 = row.try_get_log("merchant_total").unwrap_or(0); // SAFE_DEFAULT: empty ledger
        let transferred: i64 = row.try_get_log("transferred_total").unwrap_or(0); // SAFE_DEFAULT: empty ledger
        Ok((customer, merchant, transferred))
    }
}

/// Extension trait for safe row access with logging
pub trait SafeRow {
    /// Try to get a value from a column, log error and return None if it fails
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl SafeRow for sqlx::postgres::PgRow {
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        match self.try_get(column) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Failed to read column '{}': {}", column, e);
                None
            }
        }
    }
}
