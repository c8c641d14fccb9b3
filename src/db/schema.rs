//! Ledger schema bootstrap
//!
//! Idempotent: every statement is `IF NOT EXISTS`, so running it against an
//! initialized database is a no-op.

use sqlx::PgPool;

const SCHEMA_LOCK_KEY: i64 = 0x4c45_4447_4552;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts_tb (
        account_id  TEXT PRIMARY KEY,
        kind        SMALLINT NOT NULL CHECK (kind IN (1, 2)),
        owner_ref   TEXT NOT NULL,
        balance     BIGINT NOT NULL DEFAULT 0,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT accounts_tb_balance_check CHECK (kind <> 1 OR balance >= 0)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS accounts_tb_owner_idx
        ON accounts_tb (kind, owner_ref)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions_tb (
        transaction_id       TEXT PRIMARY KEY,
        cid                  TEXT,
        sender_account_id    TEXT NOT NULL REFERENCES accounts_tb (account_id),
        receiver_account_id  TEXT NOT NULL REFERENCES accounts_tb (account_id),
        amount               BIGINT NOT NULL CONSTRAINT transactions_tb_amount_check CHECK (amount > 0),
        created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT transactions_tb_cid_key UNIQUE (cid)
    )
    "#,
];

/// Create ledger tables if they do not exist
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    // Serialize concurrent bootstraps; IF NOT EXISTS alone races on the catalog
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!("Ledger schema ready");
    Ok(())
}

/// Insert an account row (administrative seeding, not a transfer)
pub async fn open_account(
    pool: &PgPool,
    account_id: &str,
    kind: crate::transfer::AccountKind,
    owner_ref: &str,
    balance: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO accounts_tb (account_id, kind, owner_ref, balance) VALUES ($1, $2, $3, $4)",
    )
    .bind(account_id)
    .bind(kind.id())
    .bind(owner_ref)
    .bind(balance)
    .execute(pool)
    .await?;
    Ok(())
}
