use crate::models::{WalletMovement, WalletTransactionType};
use crate::money::mask_iban;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Withdrawal request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(WithdrawalStatus::Pending),
            "COMPLETED" => Ok(WithdrawalStatus::Completed),
            "FAILED" => Ok(WithdrawalStatus::Failed),
            _ => Err(format!("Invalid withdrawal status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Completed => "COMPLETED",
            WithdrawalStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

/// A courier-initiated payout attempt
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub courier_id: Uuid,
    pub wallet_id: Uuid,
    pub amount: Decimal,
    /// Destination snapshot taken at request time
    pub iban: String,
    pub account_holder: String,
    pub status: String,
    /// Paid through the simulated rail, no real money moved
    pub fictitious: bool,
    pub transfer_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: NaiveDateTime,
    pub processed_at: Option<NaiveDateTime>,
}

impl WithdrawalRequest {
    pub fn new(wallet_id: Uuid, new: &NewWithdrawal) -> Self {
        Self {
            id: Uuid::new_v4(),
            courier_id: new.courier_id,
            wallet_id,
            amount: new.amount,
            iban: new.iban.clone(),
            account_holder: new.account_holder.clone(),
            status: WithdrawalStatus::Pending.as_str().to_string(),
            fictitious: new.fictitious,
            transfer_reference: None,
            failure_reason: None,
            requested_at: chrono::Utc::now().naive_utc(),
            processed_at: None,
        }
    }

    pub fn status_enum(&self) -> WithdrawalStatus {
        WithdrawalStatus::from_str(&self.status).unwrap_or(WithdrawalStatus::Pending)
    }

    pub fn is_pending(&self) -> bool {
        self.status_enum() == WithdrawalStatus::Pending
    }

    /// Same request with the destination IBAN masked, for any external read
    pub fn masked(mut self) -> Self {
        self.iban = mask_iban(&self.iban);
        self
    }
}

/// Insert payload for a withdrawal and its optimistic debit
#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub courier_id: Uuid,
    pub amount: Decimal,
    pub iban: String,
    pub account_holder: String,
    pub fictitious: bool,
    pub debit_type: WalletTransactionType,
    pub description: String,
}

/// PENDING request with the debit that reserved its funds
#[derive(Debug, Clone)]
pub struct OpenedWithdrawal {
    pub request: WithdrawalRequest,
    pub movement: WalletMovement,
}

/// How an operator resolves a withdrawal stuck in PENDING
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalResolution {
    /// Payout confirmed out of band
    Completed { transfer_reference: String },
    /// Payout did not happen; the wallet is re-credited
    Failed { reason: String },
}

/// Breakdown of withdrawal eligibility for client-facing diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalEligibility {
    pub can_withdraw: bool,
    pub has_valid_iban: bool,
    pub has_sufficient_balance: bool,
    pub above_minimum: bool,
    pub available_balance: Decimal,
    pub requested_amount: Decimal,
    pub minimum_amount: Decimal,
    pub reasons: Vec<String>,
}

/// Aggregates over all withdrawal requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalStats {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_completed_amount: Decimal,
    pub total_pending_amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_withdrawal() -> NewWithdrawal {
        NewWithdrawal {
            courier_id: Uuid::new_v4(),
            amount: Decimal::new(5000, 2),
            iban: "FR7630006000011234567890189".to_string(),
            account_holder: "Camille Martin".to_string(),
            fictitious: true,
            debit_type: WalletTransactionType::FictitiousWithdrawalDebit,
            description: "Withdrawal to ****0189".to_string(),
        }
    }

    #[test]
    fn test_new_request_is_pending() {
        let request = WithdrawalRequest::new(Uuid::new_v4(), &new_withdrawal());
        assert!(request.is_pending());
        assert!(!request.status_enum().is_terminal());
        assert!(request.processed_at.is_none());
    }

    #[test]
    fn test_masked_hides_iban() {
        let request = WithdrawalRequest::new(Uuid::new_v4(), &new_withdrawal()).masked();
        assert_eq!(request.iban, "FR76****0189");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(WithdrawalStatus::from_str("completed").unwrap(), WithdrawalStatus::Completed);
        assert_eq!(WithdrawalStatus::Failed.as_str(), "FAILED");
        assert!(WithdrawalStatus::from_str("PROCESSING").is_err());
    }
}
