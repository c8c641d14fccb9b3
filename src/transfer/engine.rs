//! Transfer Engine
//!
//! Runs one customer -> merchant transfer as a single unit of work:
//!
//! 1. begin
//! 2. lock both accounts (ascending id order) and read balances
//! 3. replay check on `cid`, then validate under the lock
//! 4. debit, credit, insert the transaction record
//! 5. commit
//!
//! Any failure after step 1 rolls the whole unit back. A deadline that
//! elapses mid-flight drops the unit of work, which is also a rollback;
//! the deadline is checked once more right before commit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{StoreError, TransferError};
use super::state::TransferState;
use super::store::{LedgerStore, UnitOfWork};
use super::types::{
    Account, AccountId, AccountKind, NewTransaction, Transaction, TransactionId, TransferRequest,
};
use super::validation::{validate_amount, validate_credit, validate_debit};
use crate::config::TransferConfig;
use crate::logging::STATE_TARGET;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Default per-call deadline
    pub timeout: Duration,
    /// Upper bound on attempts made by `transfer_with_retry`
    pub max_attempts: u32,
    /// Backoff unit; attempt n waits `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl From<&TransferConfig> for EngineConfig {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_attempts: cfg.max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

/// State tracker for a single attempt
struct Attempt {
    transaction_id: TransactionId,
    state: TransferState,
}

impl Attempt {
    fn new() -> Self {
        Self {
            transaction_id: TransactionId::new(),
            state: TransferState::Started,
        }
    }

    fn advance(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(
            target: STATE_TARGET,
            transaction_id = %self.transaction_id,
            from = %self.state,
            to = %next,
            "State transition"
        );
        self.state = next;
        Ok(())
    }
}

/// Transfer Engine
///
/// Constructed once and shared; holds no per-transfer state.
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        debug!(
            store = store.name(),
            timeout_ms = config.timeout.as_millis() as u64,
            max_attempts = config.max_attempts,
            "Transfer engine ready"
        );
        Self { store, config }
    }

    /// Transfer under the configured default deadline
    pub async fn transfer(&self, req: TransferRequest) -> Result<Transaction, TransferError> {
        let deadline = Instant::now() + self.config.timeout;
        self.transfer_with_deadline(req, deadline).await
    }

    /// Transfer that must finish by `deadline`
    ///
    /// On `Timeout` nothing was applied and the request may be retried;
    /// supplying a `cid` makes that retry safe even if the timeout raced
    /// the commit.
    pub async fn transfer_with_deadline(
        &self,
        req: TransferRequest,
        deadline: Instant,
    ) -> Result<Transaction, TransferError> {
        check_request(&req)?;

        let started = Instant::now();
        if started >= deadline {
            warn!(
                sender = %req.sender,
                receiver = %req.receiver,
                amount = req.amount,
                "Transfer deadline already elapsed, not started"
            );
            return Err(TransferError::Timeout(Duration::ZERO));
        }
        let budget = deadline - started;

        match tokio::time::timeout_at(deadline, self.run_attempt(&req, deadline, budget)).await {
            // Row lock wait was bounded by the same deadline
            Ok(Err(TransferError::Persistence(StoreError::LockTimeout(_))))
                if Instant::now() >= deadline =>
            {
                warn!(
                    sender = %req.sender,
                    receiver = %req.receiver,
                    "Transfer deadline elapsed waiting for row lock"
                );
                Err(TransferError::Timeout(budget))
            }
            Ok(result) => result,
            Err(_) => {
                warn!(
                    sender = %req.sender,
                    receiver = %req.receiver,
                    amount = req.amount,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transfer deadline elapsed, unit of work dropped"
                );
                Err(TransferError::Timeout(budget))
            }
        }
    }

    /// Transfer, retrying infrastructure failures
    ///
    /// Usage and business-rule errors are returned on first occurrence.
    /// Without a caller `cid` one is assigned for the whole retry sequence,
    /// so an attempt whose commit outcome was unknown is replayed instead of
    /// applied twice.
    pub async fn transfer_with_retry(
        &self,
        mut req: TransferRequest,
    ) -> Result<Transaction, TransferError> {
        let max_attempts = self.config.max_attempts.max(1);
        if req.cid.is_none() && max_attempts > 1 {
            req.cid = Some(format!("auto-{}", ulid::Ulid::new()));
        }

        let mut attempt = 1;
        loop {
            match self.transfer(req.clone()).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.retry_backoff * attempt;
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transfer attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Committed transaction by id
    pub async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, TransferError> {
        Ok(self.store.fetch_transaction(id).await?)
    }

    /// Committed account state
    pub async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, TransferError> {
        Ok(self.store.fetch_account(id).await?)
    }

    async fn run_attempt(
        &self,
        req: &TransferRequest,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Transaction, TransferError> {
        let mut attempt = Attempt::new();

        let mut uow = match self.store.begin(Some(budget)).await {
            Ok(uow) => uow,
            Err(e) => {
                attempt.advance(TransferState::RolledBack)?;
                return Err(e.into());
            }
        };

        // === Lock + read ===
        attempt.advance(TransferState::Validating)?;
        let accounts = match uow.lock_accounts(&req.lock_order()).await {
            Ok(accounts) => accounts,
            Err(e) => {
                return abort(uow, &mut attempt, TransferState::RolledBack, e.into()).await;
            }
        };

        // === Replay check ===
        if let Some(cid) = &req.cid {
            match uow.find_by_cid(cid).await {
                Ok(Some(existing)) if existing.matches(req) => {
                    attempt.advance(TransferState::Replayed)?;
                    release(uow).await;
                    info!(
                        transaction_id = %existing.transaction_id,
                        cid = %cid,
                        "Replayed committed transfer"
                    );
                    return Ok(existing);
                }
                Ok(Some(_)) => {
                    let err = TransferError::DuplicateRequest(cid.clone());
                    return abort(uow, &mut attempt, TransferState::Rejected, err).await;
                }
                Ok(None) => {}
                Err(e) => {
                    return abort(uow, &mut attempt, TransferState::RolledBack, e.into()).await;
                }
            }
        }

        // === Validate under lock ===
        let (sender, receiver) = match resolve_pair(&accounts, req) {
            Ok(pair) => pair,
            Err(e) => return abort(uow, &mut attempt, TransferState::Rejected, e).await,
        };
        let checked = validate_debit(sender.balance, req.amount)
            .and_then(|_| validate_credit(receiver.id.as_str(), receiver.balance, req.amount));
        if let Err(e) = checked {
            debug!(
                sender = %sender.id,
                balance = sender.balance,
                amount = req.amount,
                "Transfer rejected: {}",
                e
            );
            return abort(uow, &mut attempt, TransferState::Rejected, e.into()).await;
        }

        // === Apply ===
        attempt.advance(TransferState::Applying)?;
        let record = NewTransaction {
            transaction_id: attempt.transaction_id,
            cid: req.cid.clone(),
            sender_account_id: req.sender.clone(),
            receiver_account_id: req.receiver.clone(),
            amount: req.amount,
        };
        let applied = apply(uow.as_mut(), &record).await;
        let tx = match applied {
            Ok(tx) => tx,
            Err(e) => {
                if let TransferError::Persistence(se) = &e {
                    note_cid_race(req, se);
                }
                return abort(uow, &mut attempt, TransferState::RolledBack, e).await;
            }
        };

        // === Commit ===
        // Staged work must not become durable once the caller has given up
        if Instant::now() >= deadline {
            warn!(
                transaction_id = %tx.transaction_id,
                "Transfer deadline elapsed before commit, rolling back"
            );
            let err = TransferError::Timeout(budget);
            return abort(uow, &mut attempt, TransferState::RolledBack, err).await;
        }
        if let Err(e) = uow.commit().await {
            attempt.advance(TransferState::RolledBack)?;
            note_cid_race(req, &e);
            warn!(
                transaction_id = %tx.transaction_id,
                error = %e,
                "Commit failed, transfer rolled back"
            );
            return Err(e.into());
        }
        attempt.advance(TransferState::Committed)?;

        info!(
            transaction_id = %tx.transaction_id,
            sender = %tx.sender_account_id,
            receiver = %tx.receiver_account_id,
            amount = tx.amount,
            "Transfer committed"
        );
        Ok(tx)
    }
}

/// Usage checks that need no store access
fn check_request(req: &TransferRequest) -> Result<(), TransferError> {
    validate_amount(req.amount)?;
    if req.sender == req.receiver {
        return Err(TransferError::SameAccount);
    }
    Ok(())
}

/// Pick sender and receiver out of the locked rows and check their kinds
fn resolve_pair<'a>(
    accounts: &'a [Account],
    req: &TransferRequest,
) -> Result<(&'a Account, &'a Account), TransferError> {
    let find = |id: &AccountId| {
        accounts
            .iter()
            .find(|a| &a.id == id)
            .ok_or_else(|| TransferError::AccountNotFound(id.to_string()))
    };
    let sender = find(&req.sender)?;
    let receiver = find(&req.receiver)?;

    expect_kind(sender, AccountKind::Customer)?;
    expect_kind(receiver, AccountKind::Merchant)?;
    Ok((sender, receiver))
}

fn expect_kind(account: &Account, expected: AccountKind) -> Result<(), TransferError> {
    if account.kind != expected {
        return Err(TransferError::AccountKindMismatch {
            account: account.id.to_string(),
            expected: expected.as_str(),
            actual: account.kind.as_str(),
        });
    }
    Ok(())
}

/// Debit, credit, insert. Every statement result is checked.
async fn apply(
    uow: &mut dyn UnitOfWork,
    record: &NewTransaction,
) -> Result<Transaction, TransferError> {
    uow.apply_delta(&record.sender_account_id, -record.amount)
        .await?;
    uow.apply_delta(&record.receiver_account_id, record.amount)
        .await?;
    Ok(uow.insert_transaction(record).await?)
}

/// A unique-index hit on `cid` means a concurrent first submission with the
/// same key committed after our replay check. The error stays retryable and
/// the next attempt resolves it as a replay or a `DuplicateRequest`.
fn note_cid_race(req: &TransferRequest, err: &StoreError) -> bool {
    if !err.is_duplicate_cid() {
        return false;
    }
    warn!(
        cid = req.cid.as_deref().unwrap_or_default(),
        sender = %req.sender,
        "Concurrent submission with the same cid committed first"
    );
    true
}

/// Roll back, move the attempt to `terminal` and surface `err`
async fn abort<T>(
    uow: Box<dyn UnitOfWork>,
    attempt: &mut Attempt,
    terminal: TransferState,
    err: TransferError,
) -> Result<T, TransferError> {
    attempt.advance(terminal)?;
    release(uow).await;
    Err(err)
}

/// Explicit rollback; a failure here is logged only since dropping the
/// unit of work discards it anyway.
async fn release(uow: Box<dyn UnitOfWork>) {
    if let Err(e) = uow.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::store::{FaultPoint, InMemoryLedgerStore};
    use async_trait::async_trait;

    fn setup() -> (InMemoryLedgerStore, TransferEngine) {
        let store = InMemoryLedgerStore::new();
        store.open_account("c-1", AccountKind::Customer, "user-1", 100);
        store.open_account("c-2", AccountKind::Customer, "user-2", 100);
        store.open_account("m-1", AccountKind::Merchant, "merchant-1", 0);
        let engine = TransferEngine::new(Arc::new(store.clone()), EngineConfig::default());
        (store, engine)
    }

    // ========================================================================
    // Attempt state tracking
    // ========================================================================

    #[test]
    fn test_attempt_happy_path() {
        let mut attempt = Attempt::new();
        assert!(attempt.advance(TransferState::Validating).is_ok());
        assert!(attempt.advance(TransferState::Applying).is_ok());
        assert!(attempt.advance(TransferState::Committed).is_ok());
        assert_eq!(attempt.state, TransferState::Committed);
    }

    #[test]
    fn test_attempt_refuses_illegal_transition() {
        let mut attempt = Attempt::new();
        let err = attempt.advance(TransferState::Committed).unwrap_err();
        assert_eq!(
            err,
            TransferError::InvalidStateTransition {
                from: TransferState::Started,
                to: TransferState::Committed,
            }
        );
        // State unchanged after refusal
        assert_eq!(attempt.state, TransferState::Started);
    }

    // ========================================================================
    // Usage errors
    // ========================================================================

    #[tokio::test]
    async fn test_usage_errors_never_touch_store() {
        let (store, engine) = setup();
        store.inject_fault(FaultPoint::Begin);

        let err = engine
            .transfer(TransferRequest::new("c-1", "m-1", 0))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::InvalidAmount(0));

        let err = engine
            .transfer(TransferRequest::new("c-1", "c-1", 5))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::SameAccount);

        // Begin fault still armed: the store was never reached
        let err = engine
            .transfer(TransferRequest::new("c-1", "m-1", 5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::Persistence(StoreError::Fault("BEGIN".into()))
        );
    }

    #[tokio::test]
    async fn test_kind_mismatch() {
        let (store, engine) = setup();

        let err = engine
            .transfer(TransferRequest::new("c-1", "c-2", 10))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::AccountKindMismatch {
                account: "c-2".into(),
                expected: "MERCHANT",
                actual: "CUSTOMER",
            }
        );

        let err = engine
            .transfer(TransferRequest::new("m-1", "c-1", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::AccountKindMismatch { .. }));
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let (_store, engine) = setup();
        let err = engine
            .transfer(TransferRequest::new("ghost", "m-1", 10))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::AccountNotFound("ghost".into()));
    }

    // ========================================================================
    // Rollback paths
    // ========================================================================

    #[tokio::test]
    async fn test_rejection_releases_locks() {
        let (store, engine) = setup();

        let err = engine
            .transfer(TransferRequest::new("c-1", "m-1", 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
        assert_eq!(store.rollback_count(), 1);

        // Same rows lockable again
        let tx = engine
            .transfer(TransferRequest::new("c-1", "m-1", 10))
            .await
            .unwrap();
        assert_eq!(tx.amount, 10);
    }

    #[tokio::test]
    async fn test_insert_fault_rolls_back_debit_and_credit() {
        let (store, engine) = setup();
        let before = store.snapshot();
        store.inject_fault(FaultPoint::Insert);

        let err = engine
            .transfer(TransferRequest::new("c-1", "m-1", 40))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_commit_fault_is_persistence_error() {
        let (store, engine) = setup();
        let before = store.snapshot();
        store.inject_fault(FaultPoint::Commit);

        let err = engine
            .transfer(TransferRequest::new("c-1", "m-1", 40))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::Persistence(StoreError::Fault("COMMIT".into()))
        );
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_business_errors() {
        let (store, engine) = setup();
        let err = engine
            .transfer_with_retry(TransferRequest::new("c-1", "m-1", 1000))
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::transfer::error::ErrorClass::BusinessRule);
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_assigns_cid() {
        let (_store, engine) = setup();
        let tx = engine
            .transfer_with_retry(TransferRequest::new("c-1", "m-1", 10))
            .await
            .unwrap();
        let cid = tx.cid.expect("retry wrapper assigns a cid");
        assert!(cid.starts_with("auto-"));
    }

    // ========================================================================
    // Deadline and cid races
    // ========================================================================

    #[tokio::test]
    async fn test_elapsed_deadline_never_begins() {
        let (store, engine) = setup();
        let before = store.snapshot();

        let deadline = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = engine
            .transfer_with_deadline(TransferRequest::new("c-1", "m-1", 40), deadline)
            .await
            .unwrap_err();

        assert_eq!(err, TransferError::Timeout(Duration::ZERO));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.commit_count(), 0);
        assert_eq!(store.rollback_count(), 0);
    }

    /// Replay check that never sees committed rows, so a reused cid first
    /// surfaces at the unique index, as it does for two racing submissions
    struct StaleCidStore(InMemoryLedgerStore);

    struct StaleCidUnit(Box<dyn UnitOfWork>);

    #[async_trait]
    impl LedgerStore for StaleCidStore {
        fn name(&self) -> &'static str {
            "stale-cid"
        }

        async fn begin(
            &self,
            lock_timeout: Option<Duration>,
        ) -> Result<Box<dyn UnitOfWork>, StoreError> {
            Ok(Box::new(StaleCidUnit(self.0.begin(lock_timeout).await?)))
        }

        async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
            self.0.fetch_account(id).await
        }

        async fn fetch_transaction(
            &self,
            id: TransactionId,
        ) -> Result<Option<Transaction>, StoreError> {
            self.0.fetch_transaction(id).await
        }
    }

    #[async_trait]
    impl UnitOfWork for StaleCidUnit {
        async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
            self.0.lock_accounts(ids).await
        }

        async fn find_by_cid(&mut self, _cid: &str) -> Result<Option<Transaction>, StoreError> {
            Ok(None)
        }

        async fn apply_delta(&mut self, id: &AccountId, delta: i64) -> Result<i64, StoreError> {
            self.0.apply_delta(id, delta).await
        }

        async fn insert_transaction(
            &mut self,
            tx: &NewTransaction,
        ) -> Result<Transaction, StoreError> {
            self.0.insert_transaction(tx).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.0.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.0.rollback().await
        }
    }

    #[tokio::test]
    async fn test_cid_race_at_insert_rolls_back_and_is_retryable() {
        let (store, _) = setup();
        store.open_account("m-2", AccountKind::Merchant, "merchant-2", 0);
        let engine = TransferEngine::new(
            Arc::new(StaleCidStore(store.clone())),
            EngineConfig::default(),
        );

        engine
            .transfer(TransferRequest::with_cid("c-1", "m-1", 10, "order-1"))
            .await
            .unwrap();
        let before = store.snapshot();

        // Disjoint rows, same key: only the unique index can catch it
        let err = engine
            .transfer(TransferRequest::with_cid("c-2", "m-2", 10, "order-1"))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, TransferError::Persistence(e) if e.is_duplicate_cid()),
            "{:?}",
            err
        );
        assert!(err.is_retryable());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_note_cid_race() {
        let req = TransferRequest::with_cid("c-1", "m-1", 10, "order-1");
        assert!(note_cid_race(
            &req,
            &StoreError::Constraint("duplicate key (transactions_tb_cid_key)".into())
        ));
        assert!(!note_cid_race(
            &req,
            &StoreError::Constraint("accounts_tb_balance_check".into())
        ));
        assert!(!note_cid_race(&req, &StoreError::Fault("COMMIT".into())));
    }

    #[test]
    fn test_engine_config_from_transfer_config() {
        let cfg = TransferConfig {
            timeout_ms: 250,
            max_attempts: 0,
            retry_backoff_ms: 10,
        };
        let engine_cfg = EngineConfig::from(&cfg);
        assert_eq!(engine_cfg.timeout, Duration::from_millis(250));
        assert_eq!(engine_cfg.max_attempts, 1);
        assert_eq!(engine_cfg.retry_backoff, Duration::from_millis(10));
    }
}
