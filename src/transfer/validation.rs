//! Balance Invariant Validator
//!
//! Pure checks deciding whether a debit or credit is admissible against a
//! balance. The engine calls these only while holding the row locks that
//! the subsequent write runs under.

// ============================================================================
// Validation Errors
// ============================================================================

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Amount must be greater than zero (got {0})")]
    InvalidAmount(i64),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Balance would overflow for account {account}")]
    BalanceOverflow { account: String },
}

// ============================================================================
// Checks
// ============================================================================

/// Reject non-positive amounts
#[inline]
pub fn validate_amount(amount: i64) -> Result<(), ValidationError> {
    if amount <= 0 {
        return Err(ValidationError::InvalidAmount(amount));
    }
    Ok(())
}

/// Succeeds only if `sender_balance - amount >= 0`
///
/// An amount that cannot even be subtracted without underflow is reported as
/// insufficient funds.
///
/// # Examples
/// ```
/// use payment_ledger::transfer::validation::{validate_debit, ValidationError};
///
/// assert!(validate_debit(100, 40).is_ok());
/// assert_eq!(
///     validate_debit(30, 40),
///     Err(ValidationError::InsufficientFunds { required: 40, available: 30 })
/// );
/// ```
pub fn validate_debit(sender_balance: i64, amount: i64) -> Result<(), ValidationError> {
    validate_amount(amount)?;

    match sender_balance.checked_sub(amount) {
        Some(remaining) if remaining >= 0 => Ok(()),
        _ => Err(ValidationError::InsufficientFunds {
            required: amount,
            available: sender_balance,
        }),
    }
}

/// Reject a credit that would overflow the receiver's i64 balance
pub fn validate_credit(
    receiver: &str,
    receiver_balance: i64,
    amount: i64,
) -> Result<(), ValidationError> {
    validate_amount(amount)?;

    if receiver_balance.checked_add(amount).is_none() {
        return Err(ValidationError::BalanceOverflow {
            account: receiver.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debit_within_balance() {
        assert!(validate_debit(100, 40).is_ok());
    }

    #[test]
    fn test_debit_exact_balance() {
        // Draining to zero is allowed
        assert!(validate_debit(40, 40).is_ok());
    }

    #[test]
    fn test_debit_insufficient() {
        assert_eq!(
            validate_debit(30, 40),
            Err(ValidationError::InsufficientFunds {
                required: 40,
                available: 30
            })
        );
    }

    #[test]
    fn test_invalid_amount_precedes_funds_check() {
        // Zero balance AND zero amount: usage error wins
        assert_eq!(validate_debit(0, 0), Err(ValidationError::InvalidAmount(0)));
        assert_eq!(
            validate_debit(100, -5),
            Err(ValidationError::InvalidAmount(-5))
        );
    }

    #[test]
    fn test_debit_underflow_is_insufficient() {
        assert_eq!(
            validate_debit(i64::MIN, 1),
            Err(ValidationError::InsufficientFunds {
                required: 1,
                available: i64::MIN
            })
        );
    }

    #[test]
    fn test_debit_on_negative_balance() {
        assert!(validate_debit(-10, 1).is_err());
    }

    #[test]
    fn test_credit_overflow() {
        assert!(validate_credit("m-1", i64::MAX - 10, 10).is_ok());
        assert_eq!(
            validate_credit("m-1", i64::MAX - 10, 11),
            Err(ValidationError::BalanceOverflow {
                account: "m-1".to_string()
            })
        );
    }

    #[test]
    fn test_credit_invalid_amount() {
        assert_eq!(
            validate_credit("m-1", 0, 0),
            Err(ValidationError::InvalidAmount(0))
        );
    }
}
