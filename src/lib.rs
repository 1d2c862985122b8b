//! EcoDeli escrow and wallet ledger
//!
//! Holds client payments in escrow per delivery segment, releases them to
//! courier wallets, and pays wallets out through the payment provider.

pub mod collaborators;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod models;
pub mod money;
pub mod repositories;
pub mod services;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult};

use collaborators::DeliveryDirectory;
use gateway::{build_gateway, PaymentGateway};
use repositories::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use services::{
    AuditTrailService, EscrowService, ReconciliationMonitor, WalletService, WebhookHandler,
    WithdrawalService,
};
use std::sync::Arc;
use std::time::Duration;

/// Application state containing the store, the gateway and all services
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub escrows: Arc<EscrowService>,
    pub wallets: Arc<WalletService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    /// PostgreSQL-backed state with the gateway selected by `PAYMENT_MODE`
    pub fn new(
        pool: sqlx::PgPool,
        config: &AppConfig,
        directory: Arc<dyn DeliveryDirectory>,
        audit: Option<Arc<AuditTrailService>>,
    ) -> AppResult<Self> {
        let gateway = build_gateway(&config.gateway, config.payment.gateway_timeout())?;
        Ok(Self::assemble(
            Arc::new(PgLedgerStore::new(pool)),
            gateway,
            directory,
            config,
            audit,
        ))
    }

    /// In-process store, for tests and local runs without a database
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn DeliveryDirectory>,
        config: &AppConfig,
    ) -> Self {
        Self::assemble(
            Arc::new(MemoryLedgerStore::new()),
            gateway,
            directory,
            config,
            None,
        )
    }

    pub fn assemble(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn DeliveryDirectory>,
        config: &AppConfig,
        audit: Option<Arc<AuditTrailService>>,
    ) -> Self {
        let mut escrows = EscrowService::new(
            store.clone(),
            gateway.clone(),
            directory,
            config.payment.clone(),
        );
        let mut withdrawals =
            WithdrawalService::new(store.clone(), gateway.clone(), config.payment.clone());
        if let Some(audit) = audit {
            escrows = escrows.with_audit(audit.clone());
            withdrawals = withdrawals.with_audit(audit);
        }

        let escrows = Arc::new(escrows);
        let webhooks = Arc::new(WebhookHandler::new(
            escrows.clone(),
            config.gateway.webhook_secret.clone(),
            config.gateway.webhook_tolerance_secs,
        ));

        Self {
            wallets: Arc::new(WalletService::new(store.clone(), config.payment.clone())),
            withdrawals: Arc::new(withdrawals),
            escrows,
            webhooks,
            store,
            gateway,
        }
    }

    /// Background monitor for stale escrows and stuck withdrawals
    pub fn reconciliation_monitor(&self, config: &AppConfig) -> ReconciliationMonitor {
        ReconciliationMonitor::new(
            self.escrows.clone(),
            self.withdrawals.clone(),
            self.wallets.clone(),
        )
        .with_interval(Duration::from_secs(config.reconcile_interval_secs))
        .with_stale_after(chrono::Duration::minutes(config.stale_pending_minutes))
    }
}
