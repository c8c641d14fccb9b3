//! Payment Ledger - operator CLI
//!
//! ```text
//! payment_ledger [--env dev] <command> [args]
//!
//!   init-schema
//!   transfer <sender_account> <receiver_account> <amount> [--cid <key>]
//!   pay <user_id> <merchant_ref> <amount> [--cid <key>]
//!   show-transaction <transaction_id>
//!   show-account <account_id>
//!   health
//! ```
//!
//! Results are printed to stdout as JSON; logs go to the configured file
//! and stderr.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};

use payment_ledger::config::AppConfig;
use payment_ledger::db::{Database, schema};
use payment_ledger::transfer::{
    AccountId, EngineConfig, PaymentRequest, PaymentService, PgAccountResolver, PgLedgerStore,
    TransactionId, TransferEngine, TransferError, TransferRequest,
};

const USAGE: &str = "usage: payment_ledger [--env <env>] <init-schema|transfer|pay|show-transaction|show-account|health> [args]";

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_cid(args: &[String]) -> Option<String> {
    for i in 0..args.len() {
        if args[i] == "--cid" && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

/// Positional arguments: everything that is not a flag or a flag value
fn positionals(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args.iter().skip(1) {
        if skip {
            skip = false;
            continue;
        }
        if matches!(arg.as_str(), "--env" | "-e" | "--cid") {
            skip = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn arg<'a>(pos: &'a [String], idx: usize, name: &str) -> Result<&'a str> {
    pos.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing <{}>\n{}", name, USAGE))
}

fn parse_amount(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .with_context(|| format!("amount must be an integer in minor units, got '{}'", raw))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Engine errors carry a stable code; keep it in the CLI output
fn report(err: TransferError) -> anyhow::Error {
    anyhow!("{} ({}): {}", err.code(), err.http_status(), err)
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let app_config = AppConfig::load(&env)?;
    let _log_guard = payment_ledger::logging::init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting payment ledger in {} mode",
        env
    );

    let pos = positionals(&args);
    let command = pos.first().map(String::as_str).unwrap_or("");

    let db = Database::connect(&app_config.database)
        .await
        .context("failed to connect to PostgreSQL")?;

    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let engine = Arc::new(TransferEngine::new(
        store,
        EngineConfig::from(&app_config.transfer),
    ));

    match command {
        "init-schema" => {
            schema::init_schema(db.pool()).await?;
            println!("schema ready");
        }
        "transfer" => {
            let req = TransferRequest {
                sender: AccountId::new(arg(&pos, 1, "sender_account")?),
                receiver: AccountId::new(arg(&pos, 2, "receiver_account")?),
                amount: parse_amount(arg(&pos, 3, "amount")?)?,
                cid: get_cid(&args),
            };
            let tx = engine.transfer_with_retry(req).await.map_err(report)?;
            print_json(&tx)?;
        }
        "pay" => {
            let resolver = Arc::new(PgAccountResolver::new(db.pool().clone()));
            let service = PaymentService::new(resolver, engine.clone());
            let req = PaymentRequest {
                user_id: arg(&pos, 1, "user_id")?.to_string(),
                merchant_ref: arg(&pos, 2, "merchant_ref")?.to_string(),
                amount: parse_amount(arg(&pos, 3, "amount")?)?,
                cid: get_cid(&args),
            };
            let tx = service.pay(req).await.map_err(report)?;
            print_json(&tx)?;
        }
        "show-transaction" => {
            let raw = arg(&pos, 1, "transaction_id")?;
            let id: TransactionId = raw
                .parse()
                .map_err(|e| anyhow!("invalid transaction id '{}': {}", raw, e))?;
            match engine.get_transaction(id).await.map_err(report)? {
                Some(tx) => print_json(&tx)?,
                None => bail!("transaction {} not found", id),
            }
        }
        "show-account" => {
            let id = AccountId::new(arg(&pos, 1, "account_id")?);
            match engine.get_account(&id).await.map_err(report)? {
                Some(account) => print_json(&account)?,
                None => bail!("account {} not found", id),
            }
        }
        "health" => {
            db.health_check().await?;
            let (customer, merchant, transferred) = db.ledger_totals().await?;
            print_json(&serde_json::json!({
                "status": "ok",
                "customer_total": customer,
                "merchant_total": merchant,
                "transferred_total": transferred,
            }))?;
        }
        "" => bail!("{}", USAGE),
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}
