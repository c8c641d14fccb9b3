//! Transfer Core Types
//!
//! Account and transaction records shared by the engine, the stores and the
//! resolvers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical account identifier (`accounts_tb.account_id`)
///
/// Opaque to the engine. Ordering is used for lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transaction ID - ULID-based unique identifier
///
/// Generated by the engine before insert, so no store round trip is needed
/// to learn it. Sortable by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    /// Generate a new unique TransactionId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for TransactionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Account kind
///
/// Customer and merchant account spaces are disjoint: a transfer always
/// debits a customer and credits a merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum AccountKind {
    Customer = 1,
    Merchant = 2,
}

impl AccountKind {
    /// Numeric ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountKind::Customer),
            2 => Some(AccountKind::Merchant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Customer => "CUSTOMER",
            AccountKind::Merchant => "MERCHANT",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance-bearing account as read from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub kind: AccountKind,
    /// Owning party: user id for customers, merchant reference for merchants
    pub owner_ref: String,
    /// Running balance in minor units
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of a committed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub sender_account_id: AccountId,
    pub receiver_account_id: AccountId,
    pub amount: i64,
    /// Assigned by the store at insert time
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// True if this record describes the same movement as `req`
    pub fn matches(&self, req: &TransferRequest) -> bool {
        self.sender_account_id == req.sender
            && self.receiver_account_id == req.receiver
            && self.amount == req.amount
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] {} -> {} amount={}",
            self.transaction_id, self.sender_account_id, self.receiver_account_id, self.amount
        )
    }
}

/// Transaction row handed to the store for insertion
///
/// `created_at` is deliberately absent: the store assigns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub transaction_id: TransactionId,
    pub cid: Option<String>,
    pub sender_account_id: AccountId,
    pub receiver_account_id: AccountId,
    pub amount: i64,
}

/// Transfer request with identities already resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Customer account to debit
    pub sender: AccountId,
    /// Merchant account to credit
    pub receiver: AccountId,
    /// Amount in minor units
    pub amount: i64,
    /// Client-provided idempotency key (optional)
    #[serde(default)]
    pub cid: Option<String>,
}

impl TransferRequest {
    pub fn new(sender: impl Into<AccountId>, receiver: impl Into<AccountId>, amount: i64) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            cid: None,
        }
    }

    /// Create request with client idempotency key
    pub fn with_cid(
        sender: impl Into<AccountId>,
        receiver: impl Into<AccountId>,
        amount: i64,
        cid: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            cid: Some(cid.into()),
        }
    }

    /// Account ids in lock acquisition order (ascending, deduplicated)
    pub fn lock_order(&self) -> Vec<AccountId> {
        let mut ids = vec![self.sender.clone(), self.receiver.clone()];
        ids.sort();
        ids.dedup();
        ids
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {} -> {} amount={}",
            self.sender, self.receiver, self.amount
        )
    }
}
