use crate::collaborators::DeliveryDirectory;
use crate::config::PaymentConfig;
use crate::error::{AppError, AppResult, RepositoryError};
use crate::gateway::{bounded, Metadata, PaymentGateway};
use crate::models::{
    EscrowFilter, EscrowRelease, EscrowSlot, EscrowStats, EscrowStatus, EscrowTransaction,
    NewEscrow, OpenedEscrow, ReleasedEscrow, TransitionUpdate,
};
use crate::money::split_commission;
use crate::repositories::LedgerStore;
use crate::services::locks::KeyedLocks;
use crate::services::{validate_amount, AuditTrailService};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Escrow lifecycle: open, confirm, release, refund
pub struct EscrowService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    directory: Arc<dyn DeliveryDirectory>,
    config: PaymentConfig,
    slot_locks: KeyedLocks<EscrowSlot>,
    audit: Option<Arc<AuditTrailService>>,
}

fn describe_slot(delivery_id: Uuid, segment_number: Option<i32>) -> String {
    match segment_number {
        Some(n) => format!("delivery {} segment {}", delivery_id, n),
        None => format!("delivery {}", delivery_id),
    }
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn DeliveryDirectory>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            directory,
            config,
            slot_locks: KeyedLocks::new(),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrailService>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Open a PENDING escrow for one delivery segment and create its payment
    /// intent. The intent is created first; nothing is persisted if the
    /// gateway call fails.
    pub async fn open_escrow(
        &self,
        client_id: Uuid,
        delivery_id: Uuid,
        segment_number: Option<i32>,
        total_amount: Decimal,
    ) -> AppResult<OpenedEscrow> {
        info!(
            "Opening escrow: client={}, {}, total={}",
            client_id,
            describe_slot(delivery_id, segment_number),
            total_amount
        );

        validate_amount(total_amount, "Escrow amount")?;
        if total_amount < self.config.min_escrow_amount {
            return Err(AppError::Validation(format!(
                "Escrow amount must be at least {}",
                self.config.min_escrow_amount
            )));
        }
        if let Some(n) = segment_number {
            if n < 1 {
                return Err(AppError::Validation(format!(
                    "Segment number must be positive, got {}",
                    n
                )));
            }
        }

        let parties = self
            .directory
            .parties(delivery_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Delivery {} not found", delivery_id)))?;
        if parties.client_id != client_id {
            warn!(
                "Client {} attempted to fund delivery {} owned by {}",
                client_id, delivery_id, parties.client_id
            );
            return Err(AppError::Validation(format!(
                "Client {} does not own delivery {}",
                client_id, delivery_id
            )));
        }

        // Held through the insert so a concurrent open never creates a second intent
        let _guard = self
            .slot_locks
            .acquire(&EscrowSlot {
                delivery_id,
                segment_number,
            })
            .await;

        if let Some(active) = self
            .store
            .find_active_escrow(delivery_id, segment_number)
            .await?
        {
            return Err(AppError::IllegalState(format!(
                "{} already has escrow {} in status {}",
                describe_slot(delivery_id, segment_number),
                active.id,
                active.status
            )));
        }

        let split = split_commission(total_amount, self.config.commission_rate);

        let mut metadata = Metadata::new();
        metadata.insert("delivery_id".to_string(), delivery_id.to_string());
        metadata.insert("client_id".to_string(), client_id.to_string());
        if let Some(n) = segment_number {
            metadata.insert("segment_number".to_string(), n.to_string());
        }

        let intent = bounded(
            self.config.gateway_timeout(),
            self.gateway
                .create_intent(total_amount, &self.config.currency, &metadata),
        )
        .await
        .map_err(|e| {
            error!(
                "open_escrow: intent creation failed for {}: {}",
                describe_slot(delivery_id, segment_number),
                e
            );
            AppError::Gateway(e)
        })?;

        let escrow = EscrowTransaction::new(NewEscrow {
            payment_intent_id: intent.id.clone(),
            client_id,
            delivery_id,
            segment_number,
            split,
        });

        let escrow = match self.store.insert_escrow(&escrow).await {
            Ok(escrow) => escrow,
            Err(e) => {
                // The intent exists at the gateway without a local escrow
                error!(
                    "open_escrow: intent {} created but escrow not persisted: {}",
                    intent.id, e
                );
                return Err(match e {
                    RepositoryError::Duplicate(msg) => AppError::IllegalState(format!(
                        "{} already has an active escrow ({})",
                        describe_slot(delivery_id, segment_number),
                        msg
                    )),
                    other => other.into(),
                });
            }
        };

        info!(
            "Escrow {} opened: intent={}, commission={}, courier_amount={}",
            escrow.id, escrow.payment_intent_id, escrow.commission_amount, escrow.courier_amount
        );
        if let Some(audit) = &self.audit {
            audit.log_escrow_opened(&escrow).await;
        }

        Ok(OpenedEscrow {
            escrow,
            client_secret: intent.client_secret,
        })
    }

    /// Confirm a payment reported by the gateway. Idempotent: an escrow that
    /// already left PENDING is returned unchanged.
    pub async fn confirm_escrow(&self, payment_intent_id: &str) -> AppResult<EscrowTransaction> {
        let escrow = self.require_by_payment_ref(payment_intent_id).await?;

        if escrow.status_enum() != EscrowStatus::Pending {
            debug!(
                "confirm_escrow: escrow {} already {}, nothing to do",
                escrow.id, escrow.status
            );
            return Ok(escrow);
        }

        let status = bounded(
            self.config.gateway_timeout(),
            self.gateway.retrieve_intent(payment_intent_id),
        )
        .await
        .map_err(|e| {
            error!(
                "confirm_escrow: could not retrieve intent {} for escrow {}: {}",
                payment_intent_id, escrow.id, e
            );
            AppError::Gateway(e)
        })?;

        let (target, update) = if status.is_succeeded() {
            (EscrowStatus::Held, TransitionUpdate::default())
        } else {
            (
                EscrowStatus::Failed,
                TransitionUpdate::note(format!("Payment intent status: {}", status.as_str())),
            )
        };

        match self
            .store
            .transition_escrow(escrow.id, &[EscrowStatus::Pending], target, update)
            .await
        {
            Ok(updated) => {
                if let Some(audit) = &self.audit {
                    match target {
                        EscrowStatus::Held => audit.log_escrow_held(&updated).await,
                        _ => audit.log_escrow_failed(&updated, status.as_str()).await,
                    }
                }
                if target == EscrowStatus::Held {
                    info!("Escrow {} is now HELD", updated.id);
                } else {
                    warn!(
                        "Escrow {} FAILED: intent {} is {}",
                        updated.id,
                        payment_intent_id,
                        status.as_str()
                    );
                }
                Ok(updated)
            }
            // A concurrent confirmation won the race; report its result
            Err(RepositoryError::InvalidState(_)) => {
                self.require_by_payment_ref(payment_intent_id).await
            }
            Err(e) => {
                error!("confirm_escrow: escrow {} transition failed: {}", escrow.id, e);
                Err(e.into())
            }
        }
    }

    /// PENDING -> FAILED on a failed or canceled payment. Repeating the call
    /// on a FAILED escrow is a no-op.
    pub async fn mark_escrow_failed(
        &self,
        payment_intent_id: &str,
        reason: &str,
    ) -> AppResult<EscrowTransaction> {
        let escrow = self.require_by_payment_ref(payment_intent_id).await?;

        match escrow.status_enum() {
            EscrowStatus::Failed => return Ok(escrow),
            EscrowStatus::Pending => {}
            other => {
                return Err(AppError::IllegalState(format!(
                    "Escrow {} is {} and cannot be marked failed",
                    escrow.id,
                    other.as_str()
                )))
            }
        }

        let failed = self
            .store
            .transition_escrow(
                escrow.id,
                &[EscrowStatus::Pending],
                EscrowStatus::Failed,
                TransitionUpdate::note(reason),
            )
            .await?;

        warn!("Escrow {} marked FAILED: {}", failed.id, reason);
        if let Some(audit) = &self.audit {
            audit.log_escrow_failed(&failed, reason).await;
        }
        Ok(failed)
    }

    /// Release the segment's escrow to the courier's wallet. Succeeds at most
    /// once per escrow.
    pub async fn release_funds(
        &self,
        delivery_id: Uuid,
        courier_id: Uuid,
        segment_number: Option<i32>,
    ) -> AppResult<ReleasedEscrow> {
        let slot = EscrowSlot {
            delivery_id,
            segment_number,
        };
        let _guard = self.slot_locks.acquire(&slot).await;

        let escrow = self
            .store
            .find_active_escrow(delivery_id, segment_number)
            .await?
            .ok_or_else(|| {
                warn!(
                    "release_funds: no releasable escrow for {}",
                    describe_slot(delivery_id, segment_number)
                );
                AppError::IllegalState(format!(
                    "No PENDING or HELD escrow for {}",
                    describe_slot(delivery_id, segment_number)
                ))
            })?;

        if escrow.status_enum() == EscrowStatus::Pending {
            if !self.config.allow_unconfirmed_release {
                return Err(AppError::IllegalState(format!(
                    "Escrow {} is not confirmed yet",
                    escrow.id
                )));
            }
            warn!(
                "release_funds: escrow {} is still PENDING, releasing without payment confirmation",
                escrow.id
            );
        }

        let description = match segment_number {
            Some(n) => format!("Delivery payment #{} - segment {}", delivery_id, n),
            None => format!("Delivery payment #{}", delivery_id),
        };

        let released = self
            .store
            .release_escrow(&EscrowRelease {
                escrow_id: escrow.id,
                courier_id,
                allow_unconfirmed: self.config.allow_unconfirmed_release,
                description,
            })
            .await
            .map_err(|e| {
                error!("release_funds: escrow {} release failed: {}", escrow.id, e);
                AppError::from(e)
            })?;

        info!(
            "Released escrow {}: courier {} credited {} (balance {})",
            released.escrow.id,
            courier_id,
            released.escrow.courier_amount,
            released.movement.wallet.available_balance
        );
        if let Some(audit) = &self.audit {
            audit
                .log_funds_released(&released.escrow, released.was_unconfirmed)
                .await;
        }

        Ok(released)
    }

    /// Reverse the charge of an escrow that never reached a wallet.
    ///
    /// A refund claim is stored before the gateway call. A definite gateway
    /// refusal clears it; an unconfirmed outcome keeps it, so release stays
    /// refused until the refund is retried or reconciled.
    pub async fn refund_escrow(
        &self,
        payment_intent_id: &str,
        reason: &str,
    ) -> AppResult<EscrowTransaction> {
        let escrow = self.require_by_payment_ref(payment_intent_id).await?;
        let _guard = self.slot_locks.acquire(&escrow.slot()).await;

        // Re-read under the slot lock
        let escrow = self.require_by_payment_ref(payment_intent_id).await?;
        match escrow.status_enum() {
            EscrowStatus::Pending | EscrowStatus::Held => {}
            EscrowStatus::Released => {
                return Err(AppError::IllegalState(format!(
                    "Escrow {} was already released; released funds need a reversal, not a refund",
                    escrow.id
                )))
            }
            other => {
                return Err(AppError::IllegalState(format!(
                    "Escrow {} is already {}",
                    escrow.id,
                    other.as_str()
                )))
            }
        }

        // The claim blocks release from any process until the refund settles
        let escrow = if escrow.has_refund_claim() {
            warn!(
                "refund_escrow: retrying unconfirmed refund of escrow {}",
                escrow.id
            );
            escrow
        } else {
            self.store.claim_refund(escrow.id).await?
        };

        let refund_id = match bounded(
            self.config.gateway_timeout(),
            self.gateway.create_refund(payment_intent_id, reason),
        )
        .await
        {
            Ok(refund_id) => refund_id,
            Err(e) if e.is_ambiguous() => {
                error!(
                    "refund_escrow: refund of escrow {} unconfirmed, release stays blocked until reconciled: {}",
                    escrow.id, e
                );
                return Err(AppError::Gateway(e));
            }
            Err(e) => {
                error!(
                    "refund_escrow: gateway refund of escrow {} failed: {}",
                    escrow.id, e
                );
                if let Err(clear_err) = self.store.clear_refund_claim(escrow.id).await {
                    error!(
                        "refund_escrow: could not clear refund claim on escrow {}: {}",
                        escrow.id, clear_err
                    );
                }
                return Err(AppError::Gateway(e));
            }
        };

        let refunded = self
            .store
            .transition_escrow(
                escrow.id,
                EscrowStatus::Refunded.predecessors(),
                EscrowStatus::Refunded,
                TransitionUpdate {
                    note: Some(format!("Refunded: {}", reason)),
                    refund_id: Some(refund_id.clone()),
                },
            )
            .await
            .map_err(|e| {
                error!(
                    "refund_escrow: refund {} issued but escrow {} could not be marked REFUNDED: {}",
                    refund_id, escrow.id, e
                );
                AppError::from(e)
            })?;

        info!("Escrow {} refunded ({}): {}", refunded.id, refund_id, reason);
        if let Some(audit) = &self.audit {
            audit.log_escrow_refunded(&refunded, reason).await;
        }

        Ok(refunded)
    }

    pub async fn get_escrow(&self, id: Uuid) -> AppResult<EscrowTransaction> {
        self.store
            .find_escrow(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Escrow {} not found", id)))
    }

    pub async fn get_escrow_by_payment_ref(
        &self,
        payment_intent_id: &str,
    ) -> AppResult<EscrowTransaction> {
        self.require_by_payment_ref(payment_intent_id).await
    }

    pub async fn list_for_delivery(&self, delivery_id: Uuid) -> AppResult<Vec<EscrowTransaction>> {
        Ok(self.store.list_escrows(EscrowFilter::Delivery(delivery_id)).await?)
    }

    pub async fn list_for_client(&self, client_id: Uuid) -> AppResult<Vec<EscrowTransaction>> {
        Ok(self.store.list_escrows(EscrowFilter::Client(client_id)).await?)
    }

    pub async fn list_for_courier(&self, courier_id: Uuid) -> AppResult<Vec<EscrowTransaction>> {
        Ok(self.store.list_escrows(EscrowFilter::Courier(courier_id)).await?)
    }

    pub async fn list_by_status(&self, status: EscrowStatus) -> AppResult<Vec<EscrowTransaction>> {
        Ok(self.store.list_escrows(EscrowFilter::Status(status)).await?)
    }

    pub async fn escrow_stats(&self) -> AppResult<EscrowStats> {
        Ok(self.store.escrow_stats().await?)
    }

    /// PENDING escrows older than `older_than` and releases made without
    /// payment confirmation
    pub async fn list_stale_pending(
        &self,
        older_than: chrono::Duration,
    ) -> AppResult<Vec<EscrowTransaction>> {
        let cutoff = chrono::Utc::now().naive_utc() - older_than;
        Ok(self.store.list_stale_escrows(cutoff).await?)
    }

    async fn require_by_payment_ref(&self, payment_intent_id: &str) -> AppResult<EscrowTransaction> {
        self.store
            .find_escrow_by_payment_ref(payment_intent_id)
            .await?
            .ok_or_else(|| {
                warn!("No escrow for payment reference {}", payment_intent_id);
                AppError::NotFound(format!(
                    "No escrow for payment reference {}",
                    payment_intent_id
                ))
            })
    }
}
