use crate::config::PaymentConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    GlobalWalletStats, LedgerCheck, LedgerEntry, Page, PageRequest, Wallet, WalletStats,
    WalletTransaction, WalletTransactionType, WalletView,
};
use crate::repositories::LedgerStore;
use crate::services::validate_amount;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Normalize an IBAN (strip spaces, upper-case) and check its length
pub(crate) fn normalize_iban(raw: &str, min_length: usize) -> AppResult<String> {
    let iban: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if iban.len() < min_length {
        return Err(AppError::Validation(format!(
            "IBAN must be at least {} characters",
            min_length
        )));
    }
    if !iban.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(
            "IBAN may only contain letters and digits".to_string(),
        ));
    }
    Ok(iban)
}

pub(crate) fn normalize_holder(raw: &str) -> AppResult<String> {
    let holder = raw.trim();
    if holder.is_empty() {
        return Err(AppError::Validation(
            "Account holder name is required".to_string(),
        ));
    }
    Ok(holder.to_string())
}

/// Courier wallets: balances, bank details and ledger history
pub struct WalletService {
    store: Arc<dyn LedgerStore>,
    config: PaymentConfig,
}

impl WalletService {
    pub fn new(store: Arc<dyn LedgerStore>, config: PaymentConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_or_create_wallet(&self, courier_id: Uuid) -> AppResult<Wallet> {
        Ok(self.store.get_or_create_wallet(courier_id).await?)
    }

    /// Wallet with the IBAN masked
    pub async fn get_wallet_view(&self, courier_id: Uuid) -> AppResult<WalletView> {
        Ok(self.get_or_create_wallet(courier_id).await?.view())
    }

    /// Add `amount` to the available balance
    pub async fn credit(
        &self,
        courier_id: Uuid,
        amount: Decimal,
        description: &str,
        transaction_type: WalletTransactionType,
        delivery_id: Option<Uuid>,
    ) -> AppResult<Wallet> {
        validate_amount(amount, "Credit amount")?;
        if !transaction_type.is_credit() {
            return Err(AppError::Validation(format!(
                "{} is not a credit type",
                transaction_type.as_str()
            )));
        }

        let mut entry = LedgerEntry::new(courier_id, amount, transaction_type, description);
        if let Some(delivery_id) = delivery_id {
            entry = entry.for_delivery(delivery_id);
        }

        let movement = self.store.credit_wallet(&entry).await.map_err(|e| {
            error!("credit: wallet of courier {} not credited {}: {}", courier_id, amount, e);
            AppError::from(e)
        })?;

        info!(
            "Credited courier {} with {} ({}), balance {}",
            courier_id,
            amount,
            transaction_type.as_str(),
            movement.wallet.available_balance
        );
        Ok(movement.wallet)
    }

    /// Remove `amount` from the available balance; rejected, never clamped,
    /// when the balance is short
    pub async fn debit(
        &self,
        courier_id: Uuid,
        amount: Decimal,
        description: &str,
        transaction_type: WalletTransactionType,
    ) -> AppResult<Wallet> {
        validate_amount(amount, "Debit amount")?;
        if transaction_type.is_credit() {
            return Err(AppError::Validation(format!(
                "{} is not a debit type",
                transaction_type.as_str()
            )));
        }

        let entry = LedgerEntry::new(courier_id, amount, transaction_type, description);
        let movement = self.store.debit_wallet(&entry).await.map_err(|e| {
            warn!("debit: courier {} debit of {} rejected: {}", courier_id, amount, e);
            AppError::from(e)
        })?;

        info!(
            "Debited courier {} by {} ({}), balance {}",
            courier_id,
            amount,
            transaction_type.as_str(),
            movement.wallet.available_balance
        );
        Ok(movement.wallet)
    }

    /// Store payout bank details; the returned view masks the IBAN
    pub async fn update_bank_info(
        &self,
        courier_id: Uuid,
        iban: &str,
        account_holder: &str,
    ) -> AppResult<WalletView> {
        let iban = normalize_iban(iban, self.config.min_iban_length)?;
        let holder = normalize_holder(account_holder)?;

        let wallet = self
            .store
            .update_bank_info(courier_id, &iban, &holder)
            .await?;

        info!("Bank details updated for courier {}", courier_id);
        Ok(wallet.view())
    }

    /// Bank details configured, balance sufficient and amount above minimum
    pub async fn can_withdraw(&self, courier_id: Uuid, amount: Decimal) -> AppResult<bool> {
        let wallet = self.store.find_wallet(courier_id).await?;
        Ok(wallet
            .map(|w| w.can_withdraw(amount, self.config.min_withdrawal_amount))
            .unwrap_or(false))
    }

    /// Ledger entries, newest first, optionally of one type
    pub async fn get_transaction_history(
        &self,
        courier_id: Uuid,
        page: PageRequest,
        transaction_type: Option<WalletTransactionType>,
    ) -> AppResult<Page<WalletTransaction>> {
        match self.store.find_wallet(courier_id).await? {
            Some(wallet) => Ok(self
                .store
                .list_wallet_transactions(wallet.id, transaction_type, page)
                .await?),
            None => Ok(Page::new(Vec::new(), page, 0)),
        }
    }

    pub async fn get_wallet_stats(&self, courier_id: Uuid) -> AppResult<WalletStats> {
        let wallet = self
            .store
            .find_wallet(courier_id)
            .await?
            .unwrap_or_else(|| Wallet::new(courier_id));
        Ok(self.store.wallet_stats(&wallet).await?)
    }

    pub async fn get_global_stats(&self) -> AppResult<GlobalWalletStats> {
        Ok(self
            .store
            .global_wallet_stats(self.config.min_withdrawal_amount)
            .await?)
    }

    /// Recompute the balance from the ledger and compare with the cached one
    pub async fn verify_ledger(&self, courier_id: Uuid) -> AppResult<LedgerCheck> {
        let wallet = self
            .store
            .find_wallet(courier_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Wallet of courier {} not found", courier_id)))?;

        let check = LedgerCheck {
            courier_id,
            cached_balance: wallet.available_balance,
            ledger_balance: self.store.ledger_balance(wallet.id).await?,
        };

        if !check.is_consistent() {
            error!(
                "Ledger drift on wallet {} (courier {}): cached {}, ledger {}",
                wallet.id, courier_id, check.cached_balance, check.ledger_balance
            );
        }
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_iban() {
        assert_eq!(
            normalize_iban(" fr76 3000 6000 0112 3456 7890 189 ", 15).unwrap(),
            "FR7630006000011234567890189"
        );
        assert!(normalize_iban("FR76 3000", 15).is_err());
        assert!(normalize_iban("FR76-3000-6000-0112-3456", 15).is_err());
    }

    #[test]
    fn test_normalize_holder() {
        assert_eq!(normalize_holder("  Camille Martin ").unwrap(), "Camille Martin");
        assert!(normalize_holder("   ").is_err());
    }
}
