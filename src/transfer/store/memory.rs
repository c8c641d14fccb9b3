//! In-Memory Ledger Store
//!
//! Process-local ledger with the same locking and atomicity guarantees as
//! the PostgreSQL store:
//!
//! - one async mutex per account acts as the row lock
//! - writes are staged in the unit of work and applied under a single
//!   state lock on commit
//! - customer balances are checked against zero on write, mirroring the
//!   `accounts_tb` CHECK constraint
//!
//! Faults can be armed at named points to exercise rollback paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{LedgerStore, UnitOfWork};
use crate::transfer::error::StoreError;
use crate::transfer::types::{
    Account, AccountId, AccountKind, NewTransaction, Transaction, TransactionId,
};

/// Point in a unit of work where an armed fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    Lock,
    /// `apply_delta` with a negative delta
    Debit,
    /// `apply_delta` with a positive delta
    Credit,
    Insert,
    Commit,
}

impl FaultPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::Begin => "BEGIN",
            FaultPoint::Lock => "LOCK",
            FaultPoint::Debit => "DEBIT",
            FaultPoint::Credit => "CREDIT",
            FaultPoint::Insert => "INSERT",
            FaultPoint::Commit => "COMMIT",
        }
    }
}

/// Committed ledger contents, comparable for before/after checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub accounts: BTreeMap<AccountId, Account>,
    pub transactions: BTreeMap<TransactionId, Transaction>,
}

impl LedgerSnapshot {
    pub fn balance(&self, id: &AccountId) -> Option<i64> {
        self.accounts.get(id).map(|a| a.balance)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

struct Inner {
    state: Mutex<LedgerSnapshot>,
    row_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    /// Remaining trigger count per armed fault
    faults: Mutex<HashMap<FaultPoint, usize>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

// Poison is ignored; commit only ever swaps in a fully built state.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn trip(&self, point: FaultPoint) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        if let Some(remaining) = faults.get_mut(&point) {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(&point);
            }
            debug!(fault = point.as_str(), "Injected store fault");
            return Err(StoreError::Fault(point.as_str().to_string()));
        }
        Ok(())
    }

    fn row_lock(&self, id: &AccountId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        lock(&self.row_locks).get(id).cloned()
    }
}

/// In-memory ledger store
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LedgerSnapshot::default()),
                row_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Seed an account (administrative; bypasses the engine)
    pub fn open_account(
        &self,
        id: impl Into<AccountId>,
        kind: AccountKind,
        owner_ref: impl Into<String>,
        balance: i64,
    ) -> Account {
        let account = Account {
            id: id.into(),
            kind,
            owner_ref: owner_ref.into(),
            balance,
            created_at: Utc::now(),
        };
        lock(&self.inner.row_locks)
            .entry(account.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        lock(&self.inner.state)
            .accounts
            .insert(account.id.clone(), account.clone());
        account
    }

    /// Arm a one-shot fault
    pub fn inject_fault(&self, point: FaultPoint) {
        self.inject_faults(point, 1);
    }

    /// Arm a fault for the next `times` hits of `point`
    pub fn inject_faults(&self, point: FaultPoint, times: usize) {
        if times == 0 {
            return;
        }
        *lock(&self.inner.faults).entry(point).or_insert(0) += times;
    }

    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        lock(&self.inner.state).clone()
    }

    pub fn balance(&self, id: &AccountId) -> Option<i64> {
        lock(&self.inner.state).balance(id)
    }

    pub fn transaction_count(&self) -> usize {
        lock(&self.inner.state).transaction_count()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(
        &self,
        lock_timeout: Option<Duration>,
    ) -> Result<Box<dyn UnitOfWork>, StoreError> {
        self.inner.trip(FaultPoint::Begin)?;
        Ok(Box::new(MemoryUnitOfWork {
            inner: self.inner.clone(),
            lock_timeout,
            guards: Vec::new(),
            locked: HashSet::new(),
            deltas: BTreeMap::new(),
            pending: Vec::new(),
        }))
    }

    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        Ok(lock(&self.inner.state).accounts.get(id).cloned())
    }

    async fn fetch_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(lock(&self.inner.state).transactions.get(&id).cloned())
    }
}

struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    lock_timeout: Option<Duration>,
    /// Held row locks; released on drop
    guards: Vec<OwnedMutexGuard<()>>,
    locked: HashSet<AccountId>,
    /// Staged relative updates
    deltas: BTreeMap<AccountId, i64>,
    /// Staged inserts
    pending: Vec<Transaction>,
}

impl MemoryUnitOfWork {
    /// Committed balance plus whatever this unit of work already staged
    fn staged_account(&self, id: &AccountId) -> Option<Account> {
        let state = lock(&self.inner.state);
        let mut account = state.accounts.get(id).cloned()?;
        account.balance += self.deltas.get(id).copied().unwrap_or(0);
        Some(account)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        self.inner.trip(FaultPoint::Lock)?;

        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut accounts = Vec::with_capacity(ordered.len());
        for id in ordered {
            let Some(row_lock) = self.inner.row_lock(&id) else {
                continue;
            };

            if !self.locked.contains(&id) {
                let guard = match self.lock_timeout {
                    Some(limit) => tokio::time::timeout(limit, row_lock.lock_owned())
                        .await
                        .map_err(|_| {
                            StoreError::LockTimeout(format!("row lock on {} after {:?}", id, limit))
                        })?,
                    None => row_lock.lock_owned().await,
                };
                self.guards.push(guard);
                self.locked.insert(id.clone());
            }

            // Deleted between lookup and lock: treat as missing
            if let Some(account) = self.staged_account(&id) {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    async fn find_by_cid(&mut self, cid: &str) -> Result<Option<Transaction>, StoreError> {
        let state = lock(&self.inner.state);
        Ok(state
            .transactions
            .values()
            .find(|t| t.cid.as_deref() == Some(cid))
            .cloned())
    }

    async fn apply_delta(&mut self, id: &AccountId, delta: i64) -> Result<i64, StoreError> {
        let point = if delta < 0 {
            FaultPoint::Debit
        } else {
            FaultPoint::Credit
        };
        self.inner.trip(point)?;

        if !self.locked.contains(id) {
            return Err(StoreError::Other(format!(
                "update of {} without holding its row lock",
                id
            )));
        }

        let account = self
            .staged_account(id)
            .ok_or_else(|| StoreError::RowNotFound(format!("account {}", id)))?;

        let new_balance = account.balance.checked_add(delta).ok_or_else(|| {
            StoreError::Constraint(format!("balance out of range for account {}", id))
        })?;

        if account.kind == AccountKind::Customer && new_balance < 0 {
            return Err(StoreError::Constraint(format!(
                "accounts_tb_balance_check violated for account {}",
                id
            )));
        }

        *self.deltas.entry(id.clone()).or_insert(0) += delta;
        Ok(new_balance)
    }

    async fn insert_transaction(
        &mut self,
        tx: &NewTransaction,
    ) -> Result<Transaction, StoreError> {
        self.inner.trip(FaultPoint::Insert)?;

        {
            let state = lock(&self.inner.state);
            for account in [&tx.sender_account_id, &tx.receiver_account_id] {
                if !state.accounts.contains_key(account) {
                    return Err(StoreError::Constraint(format!(
                        "transactions_tb foreign key: unknown account {}",
                        account
                    )));
                }
            }
            let duplicate_id = state.transactions.contains_key(&tx.transaction_id)
                || self
                    .pending
                    .iter()
                    .any(|p| p.transaction_id == tx.transaction_id);
            if duplicate_id {
                return Err(StoreError::Constraint(format!(
                    "transactions_tb_pkey: {}",
                    tx.transaction_id
                )));
            }
            if let Some(cid) = &tx.cid {
                let taken = state
                    .transactions
                    .values()
                    .chain(self.pending.iter())
                    .any(|t| t.cid.as_ref() == Some(cid));
                if taken {
                    return Err(StoreError::Constraint(format!(
                        "transactions_tb_cid_key: {}",
                        cid
                    )));
                }
            }
        }

        if tx.amount <= 0 {
            return Err(StoreError::Constraint(
                "transactions_tb_amount_check".to_string(),
            ));
        }

        let record = Transaction {
            transaction_id: tx.transaction_id,
            cid: tx.cid.clone(),
            sender_account_id: tx.sender_account_id.clone(),
            receiver_account_id: tx.receiver_account_id.clone(),
            amount: tx.amount,
            created_at: Utc::now(),
        };
        self.pending.push(record.clone());
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.trip(FaultPoint::Commit)?;

        {
            let mut state = lock(&self.inner.state);

            // Build first, swap in last: all or nothing
            let mut next = state.clone();
            for (id, delta) in &self.deltas {
                let account = next
                    .accounts
                    .get_mut(id)
                    .ok_or_else(|| StoreError::RowNotFound(format!("account {}", id)))?;
                account.balance = account.balance.checked_add(*delta).ok_or_else(|| {
                    StoreError::Constraint(format!("balance out of range for account {}", id))
                })?;
            }
            for record in &self.pending {
                // Unique index backstop for two first submissions racing
                if let Some(cid) = &record.cid
                    && next.transactions.values().any(|t| t.cid.as_ref() == Some(cid))
                {
                    return Err(StoreError::Constraint(format!(
                        "transactions_tb_cid_key: {}",
                        cid
                    )));
                }
                next.transactions
                    .insert(record.transaction_id, record.clone());
            }
            *state = next;
        }

        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        store.open_account("c-1", AccountKind::Customer, "user-1", 100);
        store.open_account("m-1", AccountKind::Merchant, "merchant-1", 0);
        store
    }

    fn new_tx(amount: i64, cid: Option<&str>) -> NewTransaction {
        NewTransaction {
            transaction_id: TransactionId::new(),
            cid: cid.map(str::to_string),
            sender_account_id: "c-1".into(),
            receiver_account_id: "m-1".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_lock_returns_existing_accounts_in_order() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();

        let ids = [
            AccountId::from("m-1"),
            AccountId::from("ghost"),
            AccountId::from("c-1"),
        ];
        let accounts = uow.lock_accounts(&ids).await.unwrap();

        let got: Vec<&str> = accounts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(got, vec!["c-1", "m-1"]);
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        uow.lock_accounts(&["c-1".into(), "m-1".into()])
            .await
            .unwrap();

        assert_eq!(uow.apply_delta(&"c-1".into(), -40).await.unwrap(), 60);
        assert_eq!(uow.apply_delta(&"m-1".into(), 40).await.unwrap(), 40);
        uow.insert_transaction(&new_tx(40, None)).await.unwrap();

        assert_eq!(store.balance(&"c-1".into()), Some(100));
        assert_eq!(store.transaction_count(), 0);

        uow.commit().await.unwrap();

        assert_eq!(store.balance(&"c-1".into()), Some(60));
        assert_eq!(store.balance(&"m-1".into()), Some(40));
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_discards_staged_writes() {
        let store = seeded();
        let before = store.snapshot();
        {
            let mut uow = store.begin(None).await.unwrap();
            uow.lock_accounts(&["c-1".into()]).await.unwrap();
            uow.apply_delta(&"c-1".into(), -10).await.unwrap();
        }
        assert_eq!(store.snapshot(), before);

        // Lock was released by the drop
        let mut uow = store.begin(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(uow.lock_accounts(&["c-1".into()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_requires_lock() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        let err = uow.apply_delta(&"c-1".into(), -10).await.unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
    }

    #[tokio::test]
    async fn test_customer_balance_check() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        uow.lock_accounts(&["c-1".into()]).await.unwrap();
        let err = uow.apply_delta(&"c-1".into(), -101).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_lock_timeout_while_row_held() {
        let store = seeded();
        let mut holder = store.begin(None).await.unwrap();
        holder.lock_accounts(&["c-1".into()]).await.unwrap();

        let mut waiter = store.begin(Some(Duration::from_millis(20))).await.unwrap();
        let err = waiter.lock_accounts(&["c-1".into()]).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        holder.rollback().await.unwrap();
        assert_eq!(waiter.lock_accounts(&["c-1".into()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relock_is_noop() {
        let store = seeded();
        let mut uow = store.begin(Some(Duration::from_millis(20))).await.unwrap();
        uow.lock_accounts(&["c-1".into()]).await.unwrap();
        // Would time out if the row lock were re-acquired
        let again = uow.lock_accounts(&["c-1".into()]).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_fault_applies_nothing() {
        let store = seeded();
        let before = store.snapshot();
        store.inject_fault(FaultPoint::Commit);

        let mut uow = store.begin(None).await.unwrap();
        uow.lock_accounts(&["c-1".into(), "m-1".into()])
            .await
            .unwrap();
        uow.apply_delta(&"c-1".into(), -40).await.unwrap();
        uow.apply_delta(&"m-1".into(), 40).await.unwrap();
        uow.insert_transaction(&new_tx(40, None)).await.unwrap();

        let err = uow.commit().await.unwrap_err();
        assert_eq!(err, StoreError::Fault("COMMIT".to_string()));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let store = seeded();
        store.inject_fault(FaultPoint::Begin);
        assert!(store.begin(None).await.is_err());
        assert!(store.begin(None).await.is_ok());

        store.inject_faults(FaultPoint::Begin, 2);
        assert!(store.begin(None).await.is_err());
        store.clear_faults();
        assert!(store.begin(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_cid_rejected() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        uow.insert_transaction(&new_tx(1, Some("k-1"))).await.unwrap();
        let err = uow
            .insert_transaction(&new_tx(1, Some("k-1")))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_cid());
    }

    #[tokio::test]
    async fn test_insert_unknown_account_rejected() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        let mut tx = new_tx(1, None);
        tx.receiver_account_id = "ghost".into();
        let err = uow.insert_transaction(&tx).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_fetch_transaction_after_commit() {
        let store = seeded();
        let mut uow = store.begin(None).await.unwrap();
        let tx = new_tx(5, Some("k"));
        let inserted = uow.insert_transaction(&tx).await.unwrap();
        uow.commit().await.unwrap();

        let fetched = store
            .fetch_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, inserted);

        let mut uow = store.begin(None).await.unwrap();
        assert_eq!(uow.find_by_cid("k").await.unwrap(), Some(inserted));
        assert_eq!(uow.find_by_cid("other").await.unwrap(), None);
    }
}
