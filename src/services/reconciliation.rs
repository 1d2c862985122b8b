use crate::error::AppResult;
use crate::services::{EscrowService, WalletService, WithdrawalService};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

/// Counts found by one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub stale_escrows: usize,
    pub unconfirmed_releases: usize,
    pub pending_withdrawals: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.stale_escrows == 0 && self.unconfirmed_releases == 0 && self.pending_withdrawals == 0
    }
}

/// Periodically reports escrows and withdrawals stuck in an unconfirmed
/// state. Read-only: resolution stays with an operator.
pub struct ReconciliationMonitor {
    escrows: Arc<EscrowService>,
    withdrawals: Arc<WithdrawalService>,
    wallets: Arc<WalletService>,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl ReconciliationMonitor {
    pub fn new(
        escrows: Arc<EscrowService>,
        withdrawals: Arc<WithdrawalService>,
        wallets: Arc<WalletService>,
    ) -> Self {
        Self {
            escrows,
            withdrawals,
            wallets,
            interval: Duration::from_secs(300),
            stale_after: chrono::Duration::minutes(60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run until the task is dropped
    pub async fn start(self) {
        let mut interval = time::interval(self.interval);
        info!("Reconciliation monitor started, checking every {:?}", self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.run_once().await {
                error!("Error in reconciliation monitor: {}", e);
            }
        }
    }

    pub async fn run_once(&self) -> AppResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        for escrow in self.escrows.list_stale_pending(self.stale_after).await? {
            if escrow.unconfirmed_release {
                report.unconfirmed_releases += 1;
                warn!(
                    "Escrow {} was RELEASED before payment confirmation (intent {}, courier {:?})",
                    escrow.id, escrow.payment_intent_id, escrow.courier_id
                );
            } else if let Some(since) = escrow.refund_requested_at {
                report.stale_escrows += 1;
                warn!(
                    "Escrow {} {} with refund unconfirmed since {} (intent {})",
                    escrow.id, escrow.status, since, escrow.payment_intent_id
                );
            } else {
                report.stale_escrows += 1;
                warn!(
                    "Escrow {} PENDING since {} (intent {}, delivery {})",
                    escrow.id, escrow.created_at, escrow.payment_intent_id, escrow.delivery_id
                );
            }
        }

        for request in self.withdrawals.list_stuck_pending(self.stale_after).await? {
            report.pending_withdrawals += 1;
            warn!(
                "Withdrawal {} of {} PENDING since {} (courier {})",
                request.id, request.amount, request.requested_at, request.courier_id
            );
            if let Err(e) = self.wallets.verify_ledger(request.courier_id).await {
                warn!("Ledger check for courier {} failed: {}", request.courier_id, e);
            }
        }

        if report.is_clean() {
            info!("Reconciliation pass clean");
        } else {
            info!(
                "Reconciliation pass: {} stale escrows, {} unconfirmed releases, {} pending withdrawals",
                report.stale_escrows, report.unconfirmed_releases, report.pending_withdrawals
            );
        }
        Ok(report)
    }
}
