pub mod audit;
pub mod escrow_service;
pub mod locks;
pub mod reconciliation;
pub mod wallet_service;
pub mod webhook;
pub mod withdrawal_service;

pub use audit::AuditTrailService;
pub use escrow_service::EscrowService;
pub use locks::KeyedLocks;
pub use reconciliation::ReconciliationMonitor;
pub use wallet_service::WalletService;
pub use webhook::{WebhookHandler, WebhookOutcome};
pub use withdrawal_service::WithdrawalService;

use crate::error::{AppError, AppResult};
use crate::money::{is_currency_exact, MAX_AMOUNT};
use rust_decimal::Decimal;

/// Positive, representable in cents and within the ledger's column range
pub(crate) fn validate_amount(amount: Decimal, what: &str) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation(format!("{} must be positive", what)));
    }
    if amount > MAX_AMOUNT {
        return Err(AppError::Validation(format!(
            "{} must not exceed {}",
            what, MAX_AMOUNT
        )));
    }
    if !is_currency_exact(amount) {
        return Err(AppError::Validation(format!(
            "{} must have at most 2 decimal places",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(Decimal::new(1050, 2), "Amount").is_ok());
        assert!(validate_amount(Decimal::ZERO, "Amount").is_err());
        assert!(validate_amount(Decimal::new(-1, 0), "Amount").is_err());
        assert!(validate_amount(Decimal::new(10001, 3), "Amount").is_err());
        assert!(validate_amount(MAX_AMOUNT, "Amount").is_ok());
        assert!(validate_amount(MAX_AMOUNT + Decimal::new(1, 2), "Amount").is_err());
        assert!(validate_amount(Decimal::MAX, "Amount").is_err());
    }
}
