use crate::config::PaymentConfig;
use crate::error::{AppError, AppResult};
use crate::gateway::{bounded, Metadata, PaymentGateway, TransferDestination};
use crate::models::{
    NewWithdrawal, Page, PageRequest, WalletTransactionType, WithdrawalEligibility,
    WithdrawalRequest, WithdrawalResolution, WithdrawalStats,
};
use crate::money::iban_suffix;
use crate::repositories::LedgerStore;
use crate::services::wallet_service::{normalize_holder, normalize_iban};
use crate::services::{validate_amount, AuditTrailService};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Courier payouts: optimistic debit, transfer, then complete or compensate
pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: PaymentConfig,
    audit: Option<Arc<AuditTrailService>>,
}

impl WithdrawalService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrailService>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Debit the wallet and pay out.
    ///
    /// A definite payout failure re-credits the wallet and returns the FAILED
    /// request. An ambiguous failure (timeout, provider 5xx) leaves the request PENDING with
    /// the debit in place and returns the gateway error.
    pub async fn request_withdrawal(
        &self,
        courier_id: Uuid,
        amount: Decimal,
        iban: &str,
        account_holder: &str,
    ) -> AppResult<WithdrawalRequest> {
        validate_amount(amount, "Withdrawal amount")?;
        if amount < self.config.min_withdrawal_amount {
            return Err(AppError::Validation(format!(
                "Minimum withdrawal is {}",
                self.config.min_withdrawal_amount
            )));
        }
        let iban = normalize_iban(iban, self.config.min_iban_length)?;
        let account_holder = normalize_holder(account_holder)?;

        let available = self
            .store
            .find_wallet(courier_id)
            .await?
            .map(|w| w.available_balance)
            .unwrap_or(Decimal::ZERO);
        if available < amount {
            warn!(
                "request_withdrawal: courier {} has {}, requested {}",
                courier_id, available, amount
            );
            return Err(AppError::InsufficientFunds(format!(
                "Available balance {} is below requested {}",
                available, amount
            )));
        }

        let fictitious = self.gateway.is_simulated();
        let (debit_type, description) = if fictitious {
            (
                WalletTransactionType::FictitiousWithdrawalDebit,
                format!("Fictitious withdrawal to ****{}", iban_suffix(&iban)),
            )
        } else {
            (
                WalletTransactionType::WithdrawalDebit,
                format!("Withdrawal to ****{}", iban_suffix(&iban)),
            )
        };

        // Balance is checked again under the wallet lock
        let opened = self
            .store
            .open_withdrawal(&NewWithdrawal {
                courier_id,
                amount,
                iban: iban.clone(),
                account_holder: account_holder.clone(),
                fictitious,
                debit_type,
                description,
            })
            .await
            .map_err(|e| {
                warn!("request_withdrawal: courier {} debit rejected: {}", courier_id, e);
                AppError::from(e)
            })?;
        let request = opened.request;

        info!(
            "Withdrawal {} opened: courier {} debited {}, balance {}",
            request.id, courier_id, amount, opened.movement.wallet.available_balance
        );

        let mut metadata = Metadata::new();
        metadata.insert("withdrawal_id".to_string(), request.id.to_string());
        metadata.insert("courier_id".to_string(), courier_id.to_string());

        let destination = TransferDestination {
            iban,
            account_holder,
        };
        let transfer = bounded(
            self.config.gateway_timeout(),
            self.gateway
                .create_transfer(&destination, amount, &self.config.currency, &metadata),
        )
        .await;

        match transfer {
            Ok(reference) => {
                let completed = self
                    .store
                    .complete_withdrawal(request.id, &reference)
                    .await
                    .map_err(|e| {
                        error!(
                            "request_withdrawal: transfer {} sent but withdrawal {} not completed: {}",
                            reference, request.id, e
                        );
                        AppError::from(e)
                    })?;

                info!("Withdrawal {} completed: transfer {}", completed.id, reference);
                if let Some(audit) = &self.audit {
                    audit.log_withdrawal_completed(&completed).await;
                }
                Ok(completed.masked())
            }
            Err(e) if e.is_ambiguous() => {
                error!(
                    "request_withdrawal: payout of withdrawal {} unconfirmed, left PENDING: {}",
                    request.id, e
                );
                Err(AppError::Gateway(e))
            }
            Err(e) => {
                let reason = e.to_string();
                let failed = self.compensate(request.id, &reason).await?;
                Ok(failed.masked())
            }
        }
    }

    /// Mark a PENDING withdrawal FAILED and re-credit its amount
    async fn compensate(&self, id: Uuid, reason: &str) -> AppResult<WithdrawalRequest> {
        let failed = self.store.fail_withdrawal(id, reason).await.map_err(|e| {
            error!(
                "Withdrawal {} payout failed and compensation did not apply: {}",
                id, e
            );
            AppError::from(e)
        })?;

        warn!(
            "Withdrawal {} FAILED ({}); courier {} re-credited {}",
            failed.id, reason, failed.courier_id, failed.amount
        );
        if let Some(audit) = &self.audit {
            audit.log_withdrawal_failed(&failed).await;
        }
        Ok(failed)
    }

    /// Operator entry point for withdrawals left PENDING by an ambiguous payout
    pub async fn resolve_pending_withdrawal(
        &self,
        id: Uuid,
        resolution: WithdrawalResolution,
    ) -> AppResult<WithdrawalRequest> {
        let resolved = match resolution {
            WithdrawalResolution::Completed { transfer_reference } => {
                if transfer_reference.trim().is_empty() {
                    return Err(AppError::Validation(
                        "Transfer reference is required".to_string(),
                    ));
                }
                let completed = self
                    .store
                    .complete_withdrawal(id, transfer_reference.trim())
                    .await?;
                info!(
                    "Withdrawal {} resolved as COMPLETED ({})",
                    id, transfer_reference
                );
                if let Some(audit) = &self.audit {
                    audit.log_withdrawal_completed(&completed).await;
                }
                completed
            }
            WithdrawalResolution::Failed { reason } => self.compensate(id, &reason).await?,
        };

        Ok(resolved.masked())
    }

    pub async fn get_withdrawal(&self, id: Uuid) -> AppResult<WithdrawalRequest> {
        self.store
            .find_withdrawal(id)
            .await?
            .map(WithdrawalRequest::masked)
            .ok_or_else(|| AppError::NotFound(format!("Withdrawal {} not found", id)))
    }

    /// Newest first, IBANs masked
    pub async fn get_history(
        &self,
        courier_id: Uuid,
        page: PageRequest,
    ) -> AppResult<Page<WithdrawalRequest>> {
        let page = self.store.list_withdrawals(courier_id, page).await?;
        Ok(page.map(WithdrawalRequest::masked))
    }

    /// Each withdrawal precondition separately, with readable reasons
    pub async fn can_withdraw(
        &self,
        courier_id: Uuid,
        amount: Decimal,
    ) -> AppResult<WithdrawalEligibility> {
        let wallet = self.store.find_wallet(courier_id).await?;
        let minimum = self.config.min_withdrawal_amount;

        let available = wallet
            .as_ref()
            .map(|w| w.available_balance)
            .unwrap_or(Decimal::ZERO);
        let has_valid_iban = wallet
            .as_ref()
            .and_then(|w| w.iban.as_deref())
            .map(|iban| normalize_iban(iban, self.config.min_iban_length).is_ok())
            .unwrap_or(false)
            && wallet.as_ref().map(|w| w.has_bank_details()).unwrap_or(false);
        let has_sufficient_balance = available >= amount;
        let above_minimum = amount >= minimum;

        let mut reasons = Vec::new();
        if !has_valid_iban {
            reasons.push("No valid IBAN and account holder configured".to_string());
        }
        if !has_sufficient_balance {
            reasons.push(format!(
                "Insufficient balance: available {}, requested {}",
                available, amount
            ));
        }
        if !above_minimum {
            reasons.push(format!("Amount is below the minimum withdrawal of {}", minimum));
        }

        Ok(WithdrawalEligibility {
            can_withdraw: reasons.is_empty(),
            has_valid_iban,
            has_sufficient_balance,
            above_minimum,
            available_balance: available,
            requested_amount: amount,
            minimum_amount: minimum,
            reasons,
        })
    }

    pub async fn withdrawal_stats(&self) -> AppResult<WithdrawalStats> {
        Ok(self.store.withdrawal_stats().await?)
    }

    /// PENDING withdrawals requested more than `older_than` ago
    pub async fn list_stuck_pending(
        &self,
        older_than: chrono::Duration,
    ) -> AppResult<Vec<WithdrawalRequest>> {
        let cutoff = chrono::Utc::now().naive_utc() - older_than;
        let pending = self.store.list_pending_withdrawals(cutoff).await?;
        Ok(pending.into_iter().map(WithdrawalRequest::masked).collect())
    }
}
