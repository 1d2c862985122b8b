//! Payment Gateway Adapter.
//!
//! The core treats every provider call as fallible and latent. Services wrap
//! each call in [`bounded`] so a hung provider surfaces as
//! [`GatewayError::Timeout`] instead of blocking a money operation.

pub mod simulated;
pub mod stripe;

use crate::config::{GatewayConfig, PaymentMode};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use simulated::SimulatedGateway;
pub use stripe::StripeGateway;

/// Gateway call errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway call timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Could not decode gateway response: {0}")]
    Decode(String),

    #[error("Gateway not configured: {0}")]
    NotConfigured(String),

    /// Injected failure from the simulated gateway
    #[error("Simulated failure: {0}")]
    Simulated(String),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        match self {
            GatewayError::Timeout(_) => true,
            GatewayError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// The provider may or may not have acted on the request. Local state
    /// must stay unconfirmed; only a definite failure justifies compensation.
    ///
    /// A 5xx answer or a 409 idempotency conflict says nothing about whether
    /// the operation went through.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            GatewayError::Timeout(_) | GatewayError::Decode(_) => true,
            GatewayError::Http(e) => !e.is_connect() && !e.is_builder(),
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 409,
            GatewayError::NotConfigured(_) | GatewayError::Simulated(_) => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Metadata attached to intents and transfers
pub type Metadata = HashMap<String, String>;

/// Newly created payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// Provider-side status of a payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Succeeded,
    Processing,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    RequiresCapture,
    Canceled,
    Unknown(String),
}

impl IntentStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "succeeded" => IntentStatus::Succeeded,
            "processing" => IntentStatus::Processing,
            "requires_payment_method" => IntentStatus::RequiresPaymentMethod,
            "requires_confirmation" => IntentStatus::RequiresConfirmation,
            "requires_action" => IntentStatus::RequiresAction,
            "requires_capture" => IntentStatus::RequiresCapture,
            "canceled" => IntentStatus::Canceled,
            other => IntentStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Unknown(s) => s,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, IntentStatus::Succeeded)
    }
}

/// Outbound payout target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDestination {
    pub iban: String,
    pub account_holder: String,
}

/// External payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &Metadata,
    ) -> GatewayResult<PaymentIntent>;

    async fn retrieve_intent(&self, intent_id: &str) -> GatewayResult<IntentStatus>;

    /// Returns the provider refund id
    async fn create_refund(&self, intent_id: &str, reason: &str) -> GatewayResult<String>;

    /// Returns the provider transfer id
    async fn create_transfer(
        &self,
        destination: &TransferDestination,
        amount: Decimal,
        currency: &str,
        metadata: &Metadata,
    ) -> GatewayResult<String>;

    /// No real money moves through this gateway
    fn is_simulated(&self) -> bool;
}

/// Run a gateway call under a hard deadline
pub async fn bounded<T, F>(timeout: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout.as_secs())),
    }
}

/// Build the gateway selected by `PAYMENT_MODE`
pub fn build_gateway(
    config: &GatewayConfig,
    timeout: Duration,
) -> GatewayResult<Arc<dyn PaymentGateway>> {
    match config.mode {
        PaymentMode::Simulated => Ok(Arc::new(SimulatedGateway::new())),
        PaymentMode::Stripe => {
            let secret_key = config.secret_key.clone().ok_or_else(|| {
                GatewayError::NotConfigured("STRIPE_SECRET_KEY is not set".to_string())
            })?;
            Ok(Arc::new(StripeGateway::new(
                config.api_base.clone(),
                secret_key,
                timeout,
            )?))
        }
    }
}
