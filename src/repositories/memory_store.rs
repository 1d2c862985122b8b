//! In-process ledger store.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every trait method is a
//! critical section and the atomicity guarantees of the PostgreSQL store hold
//! trivially. Multi-step operations validate everything before mutating.

use super::{
    append_note, next_balance, reversal_description, EscrowStore, StoreResult, WalletStore,
    WithdrawalStore,
};
use crate::error::RepositoryError;
use crate::models::{
    EscrowFilter, EscrowRelease, EscrowStats, EscrowStatus, EscrowTransaction, GlobalWalletStats,
    LedgerEntry, NewWithdrawal, OpenedWithdrawal, Page, PageRequest, ReleasedEscrow,
    TransitionUpdate, Wallet, WalletMovement, WalletStats, WalletTransaction,
    WalletTransactionType, WithdrawalRequest, WithdrawalStats, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    /// Insertion order doubles as creation order
    escrows: Vec<EscrowTransaction>,
    wallets: HashMap<Uuid, Wallet>,
    transactions: Vec<WalletTransaction>,
    withdrawals: Vec<WithdrawalRequest>,
}

impl MemoryState {
    fn escrow_index(&self, id: Uuid) -> StoreResult<usize> {
        self.escrows
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Escrow {} not found", id)))
    }

    fn withdrawal_index(&self, id: Uuid) -> StoreResult<usize> {
        self.withdrawals
            .iter()
            .position(|w| w.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Withdrawal {} not found", id)))
    }

    fn wallet_mut(&mut self, courier_id: Uuid) -> &mut Wallet {
        self.wallets
            .entry(courier_id)
            .or_insert_with(|| Wallet::new(courier_id))
    }

    /// Apply a signed movement; nothing changes when it would overdraw or
    /// overflow the wallet
    fn apply_entry(
        &mut self,
        entry: &LedgerEntry,
        signed_amount: Decimal,
    ) -> StoreResult<WalletMovement> {
        let available = self
            .wallets
            .get(&entry.courier_id)
            .map(|w| w.available_balance)
            .unwrap_or(Decimal::ZERO);
        let balance_after = next_balance(available, signed_amount)?;

        let now = chrono::Utc::now().naive_utc();
        let wallet = self.wallet_mut(entry.courier_id);
        let transaction = entry.to_transaction(wallet, signed_amount, balance_after, now);
        wallet.available_balance = balance_after;
        wallet.updated_at = now;
        let wallet = wallet.clone();
        self.transactions.push(transaction.clone());
        Ok(WalletMovement {
            wallet,
            transaction,
        })
    }

    fn wallet_transactions(&self, wallet_id: Uuid) -> impl Iterator<Item = &WalletTransaction> {
        self.transactions.iter().filter(move |t| t.wallet_id == wallet_id)
    }

    fn pending_withdrawal(&self, id: Uuid) -> StoreResult<usize> {
        let idx = self.withdrawal_index(id)?;
        let request = &self.withdrawals[idx];
        if !request.is_pending() {
            return Err(RepositoryError::InvalidState(format!(
                "Withdrawal {} is already {}",
                id, request.status
            )));
        }
        Ok(idx)
    }
}

/// Ledger store kept entirely in memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of ledger entries across all wallets
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    /// Move an escrow's creation time, for staleness checks in tests
    pub async fn backdate_escrow(&self, id: Uuid, created_at: NaiveDateTime) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let idx = state.escrow_index(id)?;
        state.escrows[idx].created_at = created_at;
        Ok(())
    }
}

#[async_trait]
impl EscrowStore for MemoryLedgerStore {
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> StoreResult<EscrowTransaction> {
        let mut state = self.state.lock().await;

        if state
            .escrows
            .iter()
            .any(|e| e.payment_intent_id == escrow.payment_intent_id)
        {
            return Err(RepositoryError::Duplicate(format!(
                "payment reference {} already used",
                escrow.payment_intent_id
            )));
        }
        if state
            .escrows
            .iter()
            .any(|e| e.slot() == escrow.slot() && !e.is_terminal())
        {
            return Err(RepositoryError::Duplicate(format!(
                "active escrow already exists for delivery {} segment {:?}",
                escrow.delivery_id, escrow.segment_number
            )));
        }

        state.escrows.push(escrow.clone());
        Ok(escrow.clone())
    }

    async fn find_escrow(&self, id: Uuid) -> StoreResult<Option<EscrowTransaction>> {
        let state = self.state.lock().await;
        Ok(state.escrows.iter().find(|e| e.id == id).cloned())
    }

    async fn find_escrow_by_payment_ref(
        &self,
        payment_intent_id: &str,
    ) -> StoreResult<Option<EscrowTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .escrows
            .iter()
            .find(|e| e.payment_intent_id == payment_intent_id)
            .cloned())
    }

    async fn find_active_escrow(
        &self,
        delivery_id: Uuid,
        segment_number: Option<i32>,
    ) -> StoreResult<Option<EscrowTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .escrows
            .iter()
            .find(|e| {
                e.delivery_id == delivery_id && e.segment_number == segment_number && !e.is_terminal()
            })
            .cloned())
    }

    async fn list_escrows(&self, filter: EscrowFilter) -> StoreResult<Vec<EscrowTransaction>> {
        let state = self.state.lock().await;
        let keep = |e: &EscrowTransaction| match filter {
            EscrowFilter::Delivery(id) => e.delivery_id == id,
            EscrowFilter::Client(id) => e.client_id == id,
            EscrowFilter::Courier(id) => e.courier_id == Some(id),
            EscrowFilter::Status(status) => e.status_enum() == status,
        };
        Ok(state.escrows.iter().rev().filter(|e| keep(e)).cloned().collect())
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        update: TransitionUpdate,
    ) -> StoreResult<EscrowTransaction> {
        let mut state = self.state.lock().await;
        let idx = state.escrow_index(id)?;
        let escrow = &mut state.escrows[idx];

        let status = escrow.status_enum();
        if !from.contains(&status) {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} is {}, expected one of {:?}",
                id,
                status.as_str(),
                from.iter().map(|s| s.as_str()).collect::<Vec<_>>()
            )));
        }

        let now = chrono::Utc::now().naive_utc();
        escrow.status = to.as_str().to_string();
        if to == EscrowStatus::Held {
            escrow.held_since = Some(now);
        }
        escrow.notes = append_note(escrow.notes.as_deref(), update.note.as_deref());
        if update.refund_id.is_some() {
            escrow.refund_id = update.refund_id;
        }
        escrow.updated_at = now;

        Ok(escrow.clone())
    }

    async fn claim_refund(&self, id: Uuid) -> StoreResult<EscrowTransaction> {
        let mut state = self.state.lock().await;
        let idx = state.escrow_index(id)?;
        let escrow = &mut state.escrows[idx];

        if escrow.has_refund_claim() {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} already has a refund in progress",
                id
            )));
        }
        if escrow.is_terminal() {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} is {} and cannot be refunded",
                id, escrow.status
            )));
        }

        let now = chrono::Utc::now().naive_utc();
        escrow.refund_requested_at = Some(now);
        escrow.updated_at = now;
        Ok(escrow.clone())
    }

    async fn clear_refund_claim(&self, id: Uuid) -> StoreResult<EscrowTransaction> {
        let mut state = self.state.lock().await;
        let idx = state.escrow_index(id)?;
        let escrow = &mut state.escrows[idx];
        escrow.refund_requested_at = None;
        escrow.updated_at = chrono::Utc::now().naive_utc();
        Ok(escrow.clone())
    }

    async fn release_escrow(&self, release: &EscrowRelease) -> StoreResult<ReleasedEscrow> {
        let mut state = self.state.lock().await;
        let idx = state.escrow_index(release.escrow_id)?;
        let escrow = state.escrows[idx].clone();

        if escrow.has_refund_claim() {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} has a refund in progress",
                escrow.id
            )));
        }
        let was_unconfirmed = match escrow.status_enum() {
            EscrowStatus::Held => false,
            EscrowStatus::Pending if release.allow_unconfirmed => true,
            other => {
                return Err(RepositoryError::InvalidState(format!(
                    "Escrow {} is {} and cannot be released",
                    escrow.id,
                    other.as_str()
                )))
            }
        };

        let entry = LedgerEntry::new(
            release.courier_id,
            escrow.courier_amount,
            WalletTransactionType::DeliveryCredit,
            release.description.clone(),
        )
        .for_delivery(escrow.delivery_id)
        .for_escrow(escrow.id);
        let movement = state.apply_entry(&entry, escrow.courier_amount)?;

        let now = chrono::Utc::now().naive_utc();
        let note = was_unconfirmed.then(|| {
            format!("Released before payment confirmation to courier {}", release.courier_id)
        });
        let stored = &mut state.escrows[idx];
        stored.status = EscrowStatus::Released.as_str().to_string();
        stored.courier_id = Some(release.courier_id);
        stored.released_at = Some(now);
        stored.updated_at = now;
        stored.unconfirmed_release = was_unconfirmed;
        stored.notes = append_note(stored.notes.as_deref(), note.as_deref());

        Ok(ReleasedEscrow {
            escrow: stored.clone(),
            movement,
            was_unconfirmed,
        })
    }

    async fn escrow_stats(&self) -> StoreResult<EscrowStats> {
        let state = self.state.lock().await;
        let mut stats = EscrowStats::default();
        for escrow in &state.escrows {
            let status = escrow.status_enum();
            *stats.count_for(status) += 1;
            match status {
                EscrowStatus::Released => stats.total_commission_released += escrow.commission_amount,
                EscrowStatus::Pending | EscrowStatus::Held => {
                    stats.total_in_escrow += escrow.total_amount
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn list_stale_escrows(
        &self,
        pending_before: NaiveDateTime,
    ) -> StoreResult<Vec<EscrowTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .escrows
            .iter()
            .filter(|e| match e.status_enum() {
                EscrowStatus::Pending => {
                    e.created_at < pending_before
                        || e.refund_requested_at.map_or(false, |t| t < pending_before)
                }
                EscrowStatus::Held => e.refund_requested_at.map_or(false, |t| t < pending_before),
                EscrowStatus::Released => e.unconfirmed_release,
                _ => false,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WalletStore for MemoryLedgerStore {
    async fn find_wallet(&self, courier_id: Uuid) -> StoreResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state.wallets.get(&courier_id).cloned())
    }

    async fn get_or_create_wallet(&self, courier_id: Uuid) -> StoreResult<Wallet> {
        let mut state = self.state.lock().await;
        Ok(state.wallet_mut(courier_id).clone())
    }

    async fn credit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement> {
        let mut state = self.state.lock().await;
        state.apply_entry(entry, entry.amount)
    }

    async fn debit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement> {
        let mut state = self.state.lock().await;
        state.apply_entry(entry, -entry.amount)
    }

    async fn update_bank_info(
        &self,
        courier_id: Uuid,
        iban: &str,
        account_holder: &str,
    ) -> StoreResult<Wallet> {
        let mut state = self.state.lock().await;
        let wallet = state.wallet_mut(courier_id);
        wallet.iban = Some(iban.to_string());
        wallet.account_holder = Some(account_holder.to_string());
        wallet.updated_at = chrono::Utc::now().naive_utc();
        Ok(wallet.clone())
    }

    async fn list_wallet_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<WalletTransactionType>,
        page: PageRequest,
    ) -> StoreResult<Page<WalletTransaction>> {
        let state = self.state.lock().await;
        let matching: Vec<WalletTransaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.wallet_id == wallet_id)
            .filter(|t| transaction_type.map_or(true, |ty| t.tx_type() == Some(ty)))
            .cloned()
            .collect();
        Ok(Page::from_sorted(matching, page))
    }

    async fn wallet_stats(&self, wallet: &Wallet) -> StoreResult<WalletStats> {
        let state = self.state.lock().await;
        let mut total_earnings = Decimal::ZERO;
        let mut total_withdrawn = Decimal::ZERO;
        let mut delivery_count = 0i64;

        for tx in state.wallet_transactions(wallet.id) {
            match tx.tx_type() {
                Some(WalletTransactionType::DeliveryCredit) => {
                    total_earnings += tx.amount;
                    delivery_count += 1;
                }
                Some(t) if t.is_withdrawal_debit() => total_withdrawn -= tx.amount,
                Some(WalletTransactionType::WithdrawalReversal) => total_withdrawn -= tx.amount,
                _ => {}
            }
        }

        Ok(WalletStats {
            available_balance: wallet.available_balance,
            pending_balance: wallet.pending_balance,
            total_earnings,
            total_withdrawn,
            delivery_count,
            bank_details_configured: wallet.has_bank_details(),
        })
    }

    async fn global_wallet_stats(&self, min_withdrawal: Decimal) -> StoreResult<GlobalWalletStats> {
        let state = self.state.lock().await;
        let mut stats = GlobalWalletStats::default();
        for wallet in state.wallets.values() {
            stats.total_available += wallet.available_balance;
            stats.total_pending += wallet.pending_balance;
            if wallet.has_bank_details() && wallet.available_balance >= min_withdrawal {
                stats.wallets_eligible_for_withdrawal += 1;
            }
        }
        Ok(stats)
    }

    async fn ledger_balance(&self, wallet_id: Uuid) -> StoreResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state.wallet_transactions(wallet_id).map(|t| t.amount).sum())
    }
}

#[async_trait]
impl WithdrawalStore for MemoryLedgerStore {
    async fn open_withdrawal(&self, new: &NewWithdrawal) -> StoreResult<OpenedWithdrawal> {
        let mut state = self.state.lock().await;
        let wallet_id = state.wallet_mut(new.courier_id).id;
        let request = WithdrawalRequest::new(wallet_id, new);
        let entry = LedgerEntry::new(new.courier_id, new.amount, new.debit_type, new.description.clone())
            .for_withdrawal(request.id);
        let movement = state.apply_entry(&entry, -new.amount)?;
        state.withdrawals.push(request.clone());

        Ok(OpenedWithdrawal { request, movement })
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> StoreResult<WithdrawalRequest> {
        let mut state = self.state.lock().await;
        let idx = state.pending_withdrawal(id)?;
        let request = &mut state.withdrawals[idx];
        request.status = WithdrawalStatus::Completed.as_str().to_string();
        request.transfer_reference = Some(transfer_reference.to_string());
        request.processed_at = Some(chrono::Utc::now().naive_utc());
        Ok(request.clone())
    }

    async fn fail_withdrawal(&self, id: Uuid, reason: &str) -> StoreResult<WithdrawalRequest> {
        let mut state = self.state.lock().await;
        let idx = state.pending_withdrawal(id)?;
        let (courier_id, amount) = {
            let request = &state.withdrawals[idx];
            (request.courier_id, request.amount)
        };

        let entry = LedgerEntry::new(
            courier_id,
            amount,
            WalletTransactionType::WithdrawalReversal,
            reversal_description(id, reason),
        )
        .for_withdrawal(id);
        state.apply_entry(&entry, amount)?;

        let request = &mut state.withdrawals[idx];
        request.status = WithdrawalStatus::Failed.as_str().to_string();
        request.failure_reason = Some(reason.to_string());
        request.processed_at = Some(chrono::Utc::now().naive_utc());
        Ok(request.clone())
    }

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<WithdrawalRequest>> {
        let state = self.state.lock().await;
        Ok(state.withdrawals.iter().find(|w| w.id == id).cloned())
    }

    async fn list_withdrawals(
        &self,
        courier_id: Uuid,
        page: PageRequest,
    ) -> StoreResult<Page<WithdrawalRequest>> {
        let state = self.state.lock().await;
        let matching: Vec<WithdrawalRequest> = state
            .withdrawals
            .iter()
            .rev()
            .filter(|w| w.courier_id == courier_id)
            .cloned()
            .collect();
        Ok(Page::from_sorted(matching, page))
    }

    async fn list_pending_withdrawals(
        &self,
        requested_before: NaiveDateTime,
    ) -> StoreResult<Vec<WithdrawalRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .iter()
            .filter(|w| w.is_pending() && w.requested_at < requested_before)
            .cloned()
            .collect())
    }

    async fn withdrawal_stats(&self) -> StoreResult<WithdrawalStats> {
        let state = self.state.lock().await;
        let mut stats = WithdrawalStats::default();
        for request in &state.withdrawals {
            match request.status_enum() {
                WithdrawalStatus::Pending => {
                    stats.pending += 1;
                    stats.total_pending_amount += request.amount;
                }
                WithdrawalStatus::Completed => {
                    stats.completed += 1;
                    stats.total_completed_amount += request.amount;
                }
                WithdrawalStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::split_commission;
    use crate::models::NewEscrow;

    fn escrow(delivery_id: Uuid, segment: Option<i32>, reference: &str) -> EscrowTransaction {
        EscrowTransaction::new(NewEscrow {
            payment_intent_id: reference.to_string(),
            client_id: Uuid::new_v4(),
            delivery_id,
            segment_number: segment,
            split: split_commission(Decimal::new(10000, 2), Decimal::new(10, 2)),
        })
    }

    #[tokio::test]
    async fn test_active_slot_is_unique() {
        let store = MemoryLedgerStore::new();
        let delivery = Uuid::new_v4();

        store.insert_escrow(&escrow(delivery, Some(1), "pi_a")).await.unwrap();
        let dup = store.insert_escrow(&escrow(delivery, Some(1), "pi_b")).await;
        assert!(matches!(dup, Err(RepositoryError::Duplicate(_))));

        // Other segment and whole-delivery slots are distinct
        store.insert_escrow(&escrow(delivery, Some(2), "pi_c")).await.unwrap();
        store.insert_escrow(&escrow(delivery, None, "pi_d")).await.unwrap();

        let reused = store.insert_escrow(&escrow(Uuid::new_v4(), None, "pi_a")).await;
        assert!(matches!(reused, Err(RepositoryError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_debit_rejects_overdraft_without_side_effects() {
        let store = MemoryLedgerStore::new();
        let courier = Uuid::new_v4();
        let credit = LedgerEntry::new(
            courier,
            Decimal::new(500, 2),
            WalletTransactionType::BonusCredit,
            "bonus",
        );
        store.credit_wallet(&credit).await.unwrap();

        let debit = LedgerEntry::new(
            courier,
            Decimal::new(1000, 2),
            WalletTransactionType::FeeDebit,
            "fee",
        );
        let result = store.debit_wallet(&debit).await;
        assert!(matches!(result, Err(RepositoryError::InsufficientFunds(_))));

        let wallet = store.find_wallet(courier).await.unwrap().unwrap();
        assert_eq!(wallet.available_balance, Decimal::new(500, 2));
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryLedgerStore::new();
        let e = store.insert_escrow(&escrow(Uuid::new_v4(), None, "pi_x")).await.unwrap();

        let held = store
            .transition_escrow(e.id, &[EscrowStatus::Pending], EscrowStatus::Held, TransitionUpdate::default())
            .await
            .unwrap();
        assert_eq!(held.status_enum(), EscrowStatus::Held);
        assert!(held.held_since.is_some());

        let again = store
            .transition_escrow(e.id, &[EscrowStatus::Pending], EscrowStatus::Held, TransitionUpdate::default())
            .await;
        assert!(matches!(again, Err(RepositoryError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_refund_claim_blocks_release() {
        let store = MemoryLedgerStore::new();
        let e = store.insert_escrow(&escrow(Uuid::new_v4(), None, "pi_r")).await.unwrap();
        let release = EscrowRelease {
            escrow_id: e.id,
            courier_id: Uuid::new_v4(),
            allow_unconfirmed: true,
            description: "payment".to_string(),
        };

        let claimed = store.claim_refund(e.id).await.unwrap();
        assert!(claimed.has_refund_claim());
        assert!(matches!(
            store.claim_refund(e.id).await,
            Err(RepositoryError::InvalidState(_))
        ));
        assert!(matches!(
            store.release_escrow(&release).await,
            Err(RepositoryError::InvalidState(_))
        ));
        assert_eq!(store.transaction_count().await, 0);

        store.clear_refund_claim(e.id).await.unwrap();
        let released = store.release_escrow(&release).await.unwrap();
        assert_eq!(released.escrow.status_enum(), EscrowStatus::Released);
        assert!(matches!(
            store.claim_refund(e.id).await,
            Err(RepositoryError::InvalidState(_))
        ));
    }
}
