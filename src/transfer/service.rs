//! Payment Service
//!
//! Entry point for an authenticated caller paying a merchant: resolve both
//! parties to ledger accounts, then hand the transfer to the engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::TransferEngine;
use super::error::TransferError;
use super::resolver::AccountResolver;
use super::types::{Transaction, TransferRequest};

/// Payment as submitted by an authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Authenticated caller; identity is already verified upstream
    pub user_id: String,
    pub merchant_ref: String,
    pub amount: i64,
    #[serde(default)]
    pub cid: Option<String>,
}

pub struct PaymentService {
    resolver: Arc<dyn AccountResolver>,
    engine: Arc<TransferEngine>,
}

impl PaymentService {
    pub fn new(resolver: Arc<dyn AccountResolver>, engine: Arc<TransferEngine>) -> Self {
        Self { resolver, engine }
    }

    /// Resolve and transfer; infrastructure failures are retried by the engine
    pub async fn pay(&self, req: PaymentRequest) -> Result<Transaction, TransferError> {
        let sender = self.resolver.customer_account_for_user(&req.user_id).await?;
        let receiver = self.resolver.merchant_account(&req.merchant_ref).await?;
        debug!(
            user_id = %req.user_id,
            merchant_ref = %req.merchant_ref,
            sender = %sender,
            receiver = %receiver,
            "Payment parties resolved"
        );

        let transfer = TransferRequest {
            sender,
            receiver,
            amount: req.amount,
            cid: req.cid,
        };
        self.engine.transfer_with_retry(transfer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::engine::EngineConfig;
    use crate::transfer::resolver::StaticResolver;
    use crate::transfer::store::InMemoryLedgerStore;
    use crate::transfer::types::{AccountId, AccountKind};

    fn service() -> (InMemoryLedgerStore, PaymentService) {
        let store = InMemoryLedgerStore::new();
        store.open_account("c-1", AccountKind::Customer, "user-1", 100);
        store.open_account("m-1", AccountKind::Merchant, "shop", 0);

        let resolver = StaticResolver::new()
            .with_customer("user-1", "c-1")
            .with_merchant("shop", "m-1");
        let engine = TransferEngine::new(Arc::new(store.clone()), EngineConfig::default());
        (
            store,
            PaymentService::new(Arc::new(resolver), Arc::new(engine)),
        )
    }

    fn payment(user_id: &str, merchant_ref: &str, amount: i64) -> PaymentRequest {
        PaymentRequest {
            user_id: user_id.into(),
            merchant_ref: merchant_ref.into(),
            amount,
            cid: None,
        }
    }

    #[tokio::test]
    async fn test_pay_resolves_and_transfers() {
        let (store, svc) = service();
        let tx = svc.pay(payment("user-1", "shop", 40)).await.unwrap();

        assert_eq!(tx.sender_account_id, AccountId::from("c-1"));
        assert_eq!(tx.receiver_account_id, AccountId::from("m-1"));
        assert_eq!(store.balance(&"c-1".into()), Some(60));
        assert_eq!(store.balance(&"m-1".into()), Some(40));
    }

    #[tokio::test]
    async fn test_pay_unknown_user() {
        let (store, svc) = service();
        let err = svc.pay(payment("nobody", "shop", 40)).await.unwrap_err();
        assert!(matches!(err, TransferError::AccountNotFound(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_pay_unknown_merchant() {
        let (store, svc) = service();
        let err = svc.pay(payment("user-1", "elsewhere", 40)).await.unwrap_err();
        assert_eq!(err, TransferError::AccountNotFound("merchant elsewhere".into()));
        assert_eq!(store.balance(&"c-1".into()), Some(100));
    }

    #[tokio::test]
    async fn test_pay_replays_cid() {
        let (store, svc) = service();
        let mut req = payment("user-1", "shop", 40);
        req.cid = Some("order-77".into());

        let first = svc.pay(req.clone()).await.unwrap();
        let second = svc.pay(req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.balance(&"c-1".into()), Some(60));
    }
}
