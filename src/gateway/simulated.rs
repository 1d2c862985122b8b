//! Fictitious payment rail: no real money moves.
//!
//! Every call succeeds instantly with a `sim_` id unless a failure switch is
//! set. The switches exist for tests and staging drills.

use super::{
    GatewayError, GatewayResult, IntentStatus, Metadata, PaymentGateway, PaymentIntent,
    TransferDestination,
};
use crate::money::iban_suffix;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Default)]
pub struct SimulatedGateway {
    fail_intents: AtomicBool,
    fail_refunds: AtomicBool,
    fail_transfers: AtomicBool,
    /// HTTP status returned for transfers; 0 disables
    transfer_rejection: AtomicU16,
    latency_ms: AtomicU64,
    /// Status reported by `retrieve_intent`, per intent id
    intent_statuses: RwLock<HashMap<String, IntentStatus>>,
    intents: AtomicUsize,
    transfers: AtomicUsize,
    refunds: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_intents(&self, fail: bool) {
        self.fail_intents.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Answer transfers like the provider API would with `status`
    pub fn set_transfer_rejection(&self, status: Option<u16>) {
        self.transfer_rejection
            .store(status.unwrap_or(0), Ordering::SeqCst);
    }

    /// Delay every call, e.g. to trip the service timeout
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn set_intent_status(&self, intent_id: &str, status: IntentStatus) {
        self.intent_statuses
            .write()
            .await
            .insert(intent_id.to_string(), status);
    }

    pub fn intent_count(&self) -> usize {
        self.intents.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn sim_id(prefix: &str) -> String {
        format!("sim_{}_{}", prefix, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        _metadata: &Metadata,
    ) -> GatewayResult<PaymentIntent> {
        self.simulate_latency().await;
        if self.fail_intents.load(Ordering::SeqCst) {
            return Err(GatewayError::Simulated("intent creation refused".to_string()));
        }

        self.intents.fetch_add(1, Ordering::SeqCst);
        let id = Self::sim_id("pi");
        info!("Simulating payment intent {} for {} {}", id, amount, currency);
        Ok(PaymentIntent {
            client_secret: format!("{}_secret", id),
            id,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> GatewayResult<IntentStatus> {
        self.simulate_latency().await;
        let statuses = self.intent_statuses.read().await;
        Ok(statuses
            .get(intent_id)
            .cloned()
            .unwrap_or(IntentStatus::Succeeded))
    }

    async fn create_refund(&self, intent_id: &str, reason: &str) -> GatewayResult<String> {
        self.simulate_latency().await;
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Simulated(format!(
                "refund of {} refused",
                intent_id
            )));
        }

        self.refunds.fetch_add(1, Ordering::SeqCst);
        let id = Self::sim_id("re");
        info!("Simulating refund {} of {} ({})", id, intent_id, reason);
        Ok(id)
    }

    async fn create_transfer(
        &self,
        destination: &TransferDestination,
        amount: Decimal,
        currency: &str,
        _metadata: &Metadata,
    ) -> GatewayResult<String> {
        self.simulate_latency().await;
        if self.fail_transfers.load(Ordering::SeqCst) {
            warn!(
                "Simulated transfer of {} {} to ****{} refused",
                amount,
                currency,
                iban_suffix(&destination.iban)
            );
            return Err(GatewayError::Simulated("transfer refused".to_string()));
        }
        let rejection = self.transfer_rejection.load(Ordering::SeqCst);
        if rejection != 0 {
            warn!(
                "Simulated transfer to ****{} answered with {}",
                iban_suffix(&destination.iban),
                rejection
            );
            return Err(GatewayError::Rejected {
                status: rejection,
                message: "simulated provider answer".to_string(),
            });
        }

        self.transfers.fetch_add(1, Ordering::SeqCst);
        let id = format!(
            "sim_tr_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        info!(
            "Simulating transfer {} of {} {} to ****{}",
            id,
            amount,
            currency,
            iban_suffix(&destination.iban)
        );
        Ok(id)
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> TransferDestination {
        TransferDestination {
            iban: "FR7630006000011234567890189".to_string(),
            account_holder: "Camille Martin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_prefixed() {
        let gateway = SimulatedGateway::new();
        let intent = gateway
            .create_intent(Decimal::new(1000, 2), "eur", &Metadata::new())
            .await
            .unwrap();
        assert!(intent.id.starts_with("sim_pi_"));
        assert!(intent.client_secret.starts_with(&intent.id));
        assert_eq!(gateway.intent_count(), 1);

        let transfer = gateway
            .create_transfer(&destination(), Decimal::ONE, "eur", &Metadata::new())
            .await
            .unwrap();
        assert!(transfer.starts_with("sim_tr_"));
        assert_eq!(gateway.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let gateway = SimulatedGateway::new();
        gateway.set_fail_transfers(true);
        gateway.set_fail_refunds(true);

        assert!(gateway
            .create_transfer(&destination(), Decimal::ONE, "eur", &Metadata::new())
            .await
            .is_err());
        assert!(gateway.create_refund("sim_pi_1", "test").await.is_err());
        assert_eq!(gateway.transfer_count(), 0);
        assert_eq!(gateway.refund_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_rejection_status() {
        let gateway = SimulatedGateway::new();
        gateway.set_transfer_rejection(Some(503));
        let err = gateway
            .create_transfer(&destination(), Decimal::ONE, "eur", &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 503, .. }));

        gateway.set_transfer_rejection(None);
        assert!(gateway
            .create_transfer(&destination(), Decimal::ONE, "eur", &Metadata::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_intent_status_override() {
        let gateway = SimulatedGateway::new();
        assert_eq!(
            gateway.retrieve_intent("sim_pi_a").await.unwrap(),
            IntentStatus::Succeeded
        );
        gateway
            .set_intent_status("sim_pi_a", IntentStatus::RequiresPaymentMethod)
            .await;
        assert_eq!(
            gateway.retrieve_intent("sim_pi_a").await.unwrap(),
            IntentStatus::RequiresPaymentMethod
        );
    }
}
