//! Transfer Attempt States
//!
//! One attempt moves through:
//!
//! ```text
//! STARTED → VALIDATING ──→ APPLYING → COMMITTED
//!              │   │           │
//!              ↓   ↓           ↓
//!       REJECTED   REPLAYED    ROLLED_BACK
//! ```
//!
//! `REJECTED`, `ROLLED_BACK` and `REPLAYED` leave no new durable effect.
//! `REPLAYED` returns the transaction an earlier attempt with the same
//! client idempotency key already committed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Unit of work being opened
    Started,
    /// Accounts locked, invariants being checked
    Validating,
    /// Terminal: input or balance check failed before any write
    Rejected,
    /// Debit, credit and log insert in progress
    Applying,
    /// Terminal: unit of work committed
    Committed,
    /// Terminal: unit of work aborted after writes were staged
    RolledBack,
    /// Terminal: cid already committed with identical parameters
    Replayed,
}

impl TransferState {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Committed
                | TransferState::Rejected
                | TransferState::RolledBack
                | TransferState::Replayed
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Started, Validating)
                | (Started, RolledBack)
                | (Validating, Rejected)
                | (Validating, Applying)
                | (Validating, RolledBack)
                | (Validating, Replayed)
                | (Applying, Committed)
                | (Applying, RolledBack)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Started => "STARTED",
            TransferState::Validating => "VALIDATING",
            TransferState::Rejected => "REJECTED",
            TransferState::Applying => "APPLYING",
            TransferState::Committed => "COMMITTED",
            TransferState::RolledBack => "ROLLED_BACK",
            TransferState::Replayed => "REPLAYED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
