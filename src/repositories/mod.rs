//! Ledger Store: persistence seam for escrows, wallets and withdrawals.
//!
//! Every multi-step mutation (release, debit, withdrawal open/fail) is a
//! single atomic unit inside the store; services never compose two store
//! calls into one money movement.

pub mod escrow_repository;
pub mod memory_store;
pub mod wallet_repository;
pub mod withdrawal_repository;

use crate::error::RepositoryError;
use crate::money::MAX_AMOUNT;
use crate::models::{
    EscrowFilter, EscrowRelease, EscrowStats, EscrowStatus, EscrowTransaction, GlobalWalletStats,
    LedgerEntry, NewWithdrawal, OpenedWithdrawal, Page, PageRequest, ReleasedEscrow,
    TransitionUpdate, Wallet, WalletMovement, WalletStats, WalletTransaction,
    WalletTransactionType, WithdrawalRequest, WithdrawalStats,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

pub use memory_store::MemoryLedgerStore;

pub type StoreResult<T> = Result<T, RepositoryError>;

/// Wallet balance after applying `signed_amount` to `available`.
///
/// Overdrafts fail with `InsufficientFunds`; results beyond `MAX_AMOUNT`
/// fail with `InvalidInput` and leave the wallet untouched.
pub(crate) fn next_balance(available: Decimal, signed_amount: Decimal) -> StoreResult<Decimal> {
    let after = available
        .checked_add(signed_amount)
        .filter(|balance| *balance <= MAX_AMOUNT)
        .ok_or_else(|| {
            RepositoryError::InvalidInput(format!(
                "Balance {} cannot take a movement of {}",
                available, signed_amount
            ))
        })?;
    if after < Decimal::ZERO {
        return Err(RepositoryError::InsufficientFunds(format!(
            "available {}, required {}",
            available, -signed_amount
        )));
    }
    Ok(after)
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Persist a new PENDING escrow. Fails with `Duplicate` when the payment
    /// reference is taken or the (delivery, segment) slot already has a
    /// PENDING/HELD escrow.
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> StoreResult<EscrowTransaction>;

    async fn find_escrow(&self, id: Uuid) -> StoreResult<Option<EscrowTransaction>>;

    async fn find_escrow_by_payment_ref(
        &self,
        payment_intent_id: &str,
    ) -> StoreResult<Option<EscrowTransaction>>;

    /// The PENDING/HELD escrow for a slot, if any
    async fn find_active_escrow(
        &self,
        delivery_id: Uuid,
        segment_number: Option<i32>,
    ) -> StoreResult<Option<EscrowTransaction>>;

    /// Newest first
    async fn list_escrows(&self, filter: EscrowFilter) -> StoreResult<Vec<EscrowTransaction>>;

    /// Compare-and-set status change. Fails with `InvalidState` when the
    /// current status is not one of `from`.
    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        update: TransitionUpdate,
    ) -> StoreResult<EscrowTransaction>;

    /// Mark a PENDING/HELD escrow as having a gateway refund in flight.
    /// Fails with `InvalidState` when it is in another status or already
    /// claimed.
    async fn claim_refund(&self, id: Uuid) -> StoreResult<EscrowTransaction>;

    /// Drop the claim after the gateway definitely refused the refund
    async fn clear_refund_claim(&self, id: Uuid) -> StoreResult<EscrowTransaction>;

    /// Lock the escrow, credit the courier and mark it RELEASED, all or
    /// nothing. Fails with `InvalidState` while a refund claim is set.
    async fn release_escrow(&self, release: &EscrowRelease) -> StoreResult<ReleasedEscrow>;

    async fn escrow_stats(&self) -> StoreResult<EscrowStats>;

    /// PENDING escrows created before `pending_before`, live escrows whose
    /// refund claim predates it, plus RELEASED escrows flagged as released
    /// without confirmation
    async fn list_stale_escrows(
        &self,
        pending_before: NaiveDateTime,
    ) -> StoreResult<Vec<EscrowTransaction>>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn find_wallet(&self, courier_id: Uuid) -> StoreResult<Option<Wallet>>;

    async fn get_or_create_wallet(&self, courier_id: Uuid) -> StoreResult<Wallet>;

    async fn credit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement>;

    /// Fails with `InsufficientFunds` and leaves the wallet untouched when
    /// the available balance is below `entry.amount`.
    async fn debit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement>;

    async fn update_bank_info(
        &self,
        courier_id: Uuid,
        iban: &str,
        account_holder: &str,
    ) -> StoreResult<Wallet>;

    /// Newest first
    async fn list_wallet_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<WalletTransactionType>,
        page: PageRequest,
    ) -> StoreResult<Page<WalletTransaction>>;

    async fn wallet_stats(&self, wallet: &Wallet) -> StoreResult<WalletStats>;

    async fn global_wallet_stats(&self, min_withdrawal: Decimal) -> StoreResult<GlobalWalletStats>;

    /// Sum of all signed ledger amounts for the wallet
    async fn ledger_balance(&self, wallet_id: Uuid) -> StoreResult<Decimal>;
}

#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    /// Lock the wallet, re-check the balance, record the PENDING request and
    /// its debit entry in one unit.
    async fn open_withdrawal(&self, new: &NewWithdrawal) -> StoreResult<OpenedWithdrawal>;

    /// PENDING -> COMPLETED
    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> StoreResult<WithdrawalRequest>;

    /// PENDING -> FAILED with a compensating credit of the full amount
    async fn fail_withdrawal(&self, id: Uuid, reason: &str) -> StoreResult<WithdrawalRequest>;

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<WithdrawalRequest>>;

    /// Newest first
    async fn list_withdrawals(
        &self,
        courier_id: Uuid,
        page: PageRequest,
    ) -> StoreResult<Page<WithdrawalRequest>>;

    async fn list_pending_withdrawals(
        &self,
        requested_before: NaiveDateTime,
    ) -> StoreResult<Vec<WithdrawalRequest>>;

    async fn withdrawal_stats(&self) -> StoreResult<WithdrawalStats>;
}

/// Everything the services need from persistence
pub trait LedgerStore: EscrowStore + WalletStore + WithdrawalStore {}

impl<T> LedgerStore for T where T: EscrowStore + WalletStore + WithdrawalStore {}

/// PostgreSQL-backed ledger store.
///
/// The trait implementations are split by entity across
/// `escrow_repository`, `wallet_repository` and `withdrawal_repository`.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Reversal credit description for a failed payout
pub(crate) fn reversal_description(withdrawal_id: Uuid, reason: &str) -> String {
    format!("Reversal of failed withdrawal {}: {}", withdrawal_id, reason)
}

/// Append a transition note to existing escrow notes
pub(crate) fn append_note(existing: Option<&str>, note: Option<&str>) -> Option<String> {
    match (existing, note) {
        (Some(old), Some(new)) if !old.is_empty() => Some(format!("{}\n{}", old, new)),
        (_, Some(new)) => Some(new.to_string()),
        (old, None) => old.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_note() {
        assert_eq!(append_note(None, None), None);
        assert_eq!(append_note(None, Some("a")), Some("a".to_string()));
        assert_eq!(append_note(Some("a"), None), Some("a".to_string()));
        assert_eq!(append_note(Some("a"), Some("b")), Some("a\nb".to_string()));
        assert_eq!(append_note(Some(""), Some("b")), Some("b".to_string()));
    }

    #[test]
    fn test_next_balance_bounds() {
        assert_eq!(
            next_balance(Decimal::new(1000, 2), Decimal::new(-250, 2)).unwrap(),
            Decimal::new(750, 2)
        );
        assert!(matches!(
            next_balance(Decimal::new(100, 2), Decimal::new(-101, 2)),
            Err(RepositoryError::InsufficientFunds(_))
        ));
        assert!(matches!(
            next_balance(MAX_AMOUNT, Decimal::new(1, 2)),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert!(matches!(
            next_balance(Decimal::MAX, Decimal::MAX),
            Err(RepositoryError::InvalidInput(_))
        ));
    }
}
