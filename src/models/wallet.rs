//! Courier wallet and immutable ledger entries

use crate::money::mask_iban;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A courier's payable balance
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub courier_id: Uuid,
    pub available_balance: Decimal,
    pub pending_balance: Decimal,
    pub iban: Option<String>,
    pub account_holder: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Wallet {
    /// Empty wallet for a courier seen for the first time
    pub fn new(courier_id: Uuid) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            courier_id,
            available_balance: Decimal::ZERO,
            pending_balance: Decimal::ZERO,
            iban: None,
            account_holder: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_balance(&self) -> Decimal {
        self.available_balance + self.pending_balance
    }

    /// IBAN and account holder are both configured
    pub fn has_bank_details(&self) -> bool {
        let iban_ok = self.iban.as_deref().map(|i| !i.trim().is_empty()).unwrap_or(false);
        let holder_ok = self
            .account_holder
            .as_deref()
            .map(|h| !h.trim().is_empty())
            .unwrap_or(false);
        iban_ok && holder_ok
    }

    pub fn can_withdraw(&self, amount: Decimal, minimum: Decimal) -> bool {
        self.has_bank_details() && amount >= minimum && self.available_balance >= amount
    }

    pub fn view(&self) -> WalletView {
        WalletView::from(self)
    }
}

/// Wallet as shown outside the ledger: IBAN masked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletView {
    pub courier_id: Uuid,
    pub available_balance: Decimal,
    pub pending_balance: Decimal,
    pub total_balance: Decimal,
    pub iban: Option<String>,
    pub account_holder: Option<String>,
    pub bank_details_configured: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<&Wallet> for WalletView {
    fn from(wallet: &Wallet) -> Self {
        Self {
            courier_id: wallet.courier_id,
            available_balance: wallet.available_balance,
            pending_balance: wallet.pending_balance,
            total_balance: wallet.total_balance(),
            iban: wallet.iban.as_deref().map(mask_iban),
            account_holder: wallet.account_holder.clone(),
            bank_details_configured: wallet.has_bank_details(),
            created_at: wallet.created_at,
            updated_at: wallet.updated_at,
        }
    }
}

/// Ledger entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionType {
    /// Courier share of a released escrow
    DeliveryCredit,
    WithdrawalDebit,
    /// Withdrawal paid out through the simulated rail
    FictitiousWithdrawalDebit,
    /// Compensation for a failed payout
    WithdrawalReversal,
    BonusCredit,
    FeeDebit,
    CorrectionCredit,
    CorrectionDebit,
}

impl WalletTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliveryCredit => "delivery_credit",
            Self::WithdrawalDebit => "withdrawal_debit",
            Self::FictitiousWithdrawalDebit => "fictitious_withdrawal_debit",
            Self::WithdrawalReversal => "withdrawal_reversal",
            Self::BonusCredit => "bonus_credit",
            Self::FeeDebit => "fee_debit",
            Self::CorrectionCredit => "correction_credit",
            Self::CorrectionDebit => "correction_debit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "delivery_credit" => Some(Self::DeliveryCredit),
            "withdrawal_debit" => Some(Self::WithdrawalDebit),
            "fictitious_withdrawal_debit" => Some(Self::FictitiousWithdrawalDebit),
            "withdrawal_reversal" => Some(Self::WithdrawalReversal),
            "bonus_credit" => Some(Self::BonusCredit),
            "fee_debit" => Some(Self::FeeDebit),
            "correction_credit" => Some(Self::CorrectionCredit),
            "correction_debit" => Some(Self::CorrectionDebit),
            _ => None,
        }
    }

    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::DeliveryCredit
                | Self::WithdrawalReversal
                | Self::BonusCredit
                | Self::CorrectionCredit
        )
    }

    pub fn is_withdrawal_debit(&self) -> bool {
        matches!(self, Self::WithdrawalDebit | Self::FictitiousWithdrawalDebit)
    }
}

/// All ledger writes are synchronous and final
pub const TRANSACTION_COMPLETED: &str = "COMPLETED";

/// Immutable ledger entry; the amount is signed (credit > 0, debit < 0)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: String,
    pub description: String,
    pub delivery_id: Option<Uuid>,
    pub escrow_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub external_reference: Option<String>,
    pub status: String,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub created_at: NaiveDateTime,
}

impl WalletTransaction {
    pub fn tx_type(&self) -> Option<WalletTransactionType> {
        WalletTransactionType::from_str(&self.transaction_type)
    }

    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_debit(&self) -> bool {
        self.amount < Decimal::ZERO
    }
}

/// A balance movement request. `amount` is the positive magnitude; the
/// direction comes from the operation (credit or debit).
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub courier_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: WalletTransactionType,
    pub description: String,
    pub delivery_id: Option<Uuid>,
    pub escrow_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub external_reference: Option<String>,
}

impl LedgerEntry {
    pub fn new(
        courier_id: Uuid,
        amount: Decimal,
        transaction_type: WalletTransactionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            courier_id,
            amount,
            transaction_type,
            description: description.into(),
            delivery_id: None,
            escrow_id: None,
            withdrawal_id: None,
            external_reference: None,
        }
    }

    pub fn for_delivery(mut self, delivery_id: Uuid) -> Self {
        self.delivery_id = Some(delivery_id);
        self
    }

    pub fn for_escrow(mut self, escrow_id: Uuid) -> Self {
        self.escrow_id = Some(escrow_id);
        self
    }

    pub fn for_withdrawal(mut self, withdrawal_id: Uuid) -> Self {
        self.withdrawal_id = Some(withdrawal_id);
        self
    }

    /// Build the immutable row for this entry applied to `wallet`.
    /// `signed_amount` is negative for debits.
    pub fn to_transaction(
        &self,
        wallet: &Wallet,
        signed_amount: Decimal,
        balance_after: Decimal,
        at: NaiveDateTime,
    ) -> WalletTransaction {
        WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            amount: signed_amount,
            transaction_type: self.transaction_type.as_str().to_string(),
            description: self.description.clone(),
            delivery_id: self.delivery_id,
            escrow_id: self.escrow_id,
            withdrawal_id: self.withdrawal_id,
            external_reference: self.external_reference.clone(),
            status: TRANSACTION_COMPLETED.to_string(),
            balance_before: wallet.available_balance,
            balance_after,
            created_at: at,
        }
    }
}

/// Wallet after a credit or debit, with the ledger entry that produced it
#[derive(Debug, Clone)]
pub struct WalletMovement {
    pub wallet: Wallet,
    pub transaction: WalletTransaction,
}

/// Per-courier earnings summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletStats {
    pub available_balance: Decimal,
    pub pending_balance: Decimal,
    pub total_earnings: Decimal,
    /// Withdrawal debits net of reversals
    pub total_withdrawn: Decimal,
    pub delivery_count: i64,
    pub bank_details_configured: bool,
}

/// Platform-wide wallet totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalWalletStats {
    pub total_available: Decimal,
    pub total_pending: Decimal,
    pub wallets_eligible_for_withdrawal: i64,
}

/// Cached balance vs. balance recomputed from the transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCheck {
    pub courier_id: Uuid,
    pub cached_balance: Decimal,
    pub ledger_balance: Decimal,
}

impl LedgerCheck {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.ledger_balance
    }

    pub fn drift(&self) -> Decimal {
        self.cached_balance - self.ledger_balance
    }
}
