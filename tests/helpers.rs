#![allow(dead_code)]

use ecodeli_escrow::collaborators::InMemoryDeliveryDirectory;
use ecodeli_escrow::config::PaymentConfig;
use ecodeli_escrow::gateway::SimulatedGateway;
use ecodeli_escrow::models::*;
use ecodeli_escrow::repositories::MemoryLedgerStore;
use ecodeli_escrow::services::{EscrowService, WalletService, WebhookHandler, WithdrawalService};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const VALID_IBAN: &str = "FR76 3000 6000 0112 3456 7890 189";
pub const HOLDER: &str = "Camille Martin";

/// Services wired to the in-memory store and the simulated gateway
pub struct TestHarness {
    pub store: Arc<MemoryLedgerStore>,
    pub gateway: Arc<SimulatedGateway>,
    pub directory: Arc<InMemoryDeliveryDirectory>,
    pub escrows: Arc<EscrowService>,
    pub wallets: Arc<WalletService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub webhooks: Arc<WebhookHandler>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_payment_config())
    }

    pub fn with_config(config: PaymentConfig) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let directory = Arc::new(InMemoryDeliveryDirectory::new());

        let escrows = Arc::new(EscrowService::new(
            store.clone(),
            gateway.clone(),
            directory.clone(),
            config.clone(),
        ));
        let wallets = Arc::new(WalletService::new(store.clone(), config.clone()));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            gateway.clone(),
            config,
        ));
        let webhooks = Arc::new(WebhookHandler::new(
            escrows.clone(),
            Some(WEBHOOK_SECRET.to_string()),
            300,
        ));

        Self {
            store,
            gateway,
            directory,
            escrows,
            wallets,
            withdrawals,
            webhooks,
        }
    }

    /// Register a delivery owned by a fresh client; returns (client, delivery)
    pub async fn delivery(&self) -> (Uuid, Uuid) {
        let client_id = Uuid::new_v4();
        let delivery_id = Uuid::new_v4();
        self.directory.register(delivery_id, client_id).await;
        (client_id, delivery_id)
    }

    /// Open and confirm an escrow for a new delivery
    pub async fn held_escrow(&self, total: Decimal) -> EscrowTransaction {
        let (client_id, delivery_id) = self.delivery().await;
        let opened = self
            .escrows
            .open_escrow(client_id, delivery_id, None, total)
            .await
            .expect("Failed to open escrow");
        self.escrows
            .confirm_escrow(&opened.escrow.payment_intent_id)
            .await
            .expect("Failed to confirm escrow")
    }

    /// Courier with bank details and `balance` credited
    pub async fn funded_courier(&self, balance: Decimal) -> Uuid {
        let courier_id = Uuid::new_v4();
        self.wallets
            .update_bank_info(courier_id, VALID_IBAN, HOLDER)
            .await
            .expect("Failed to set bank info");
        if balance > Decimal::ZERO {
            self.wallets
                .credit(
                    courier_id,
                    balance,
                    "Opening balance",
                    WalletTransactionType::BonusCredit,
                    None,
                )
                .await
                .expect("Failed to credit wallet");
        }
        courier_id
    }

    pub async fn balance(&self, courier_id: Uuid) -> Decimal {
        self.wallets
            .get_or_create_wallet(courier_id)
            .await
            .expect("Failed to load wallet")
            .available_balance
    }
}

pub fn test_payment_config() -> PaymentConfig {
    PaymentConfig {
        commission_rate: dec!(0.10),
        min_escrow_amount: dec!(1.00),
        min_withdrawal_amount: dec!(1.00),
        min_iban_length: 15,
        currency: "eur".to_string(),
        allow_unconfirmed_release: true,
        gateway_timeout_secs: 1,
    }
}

/// Simulated latency long enough to trip the one-second test timeout
pub fn beyond_timeout() -> Duration {
    Duration::from_millis(1500)
}

/// Provider-shaped event body
pub fn event_payload(event_type: &str, object_id: &str) -> String {
    serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": { "object": { "id": object_id } }
    })
    .to_string()
}
