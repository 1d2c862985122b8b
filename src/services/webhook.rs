//! Payment provider webhook verification and dispatch.
//!
//! Providers retry deliveries on timeout, so every branch here must be safe
//! to run more than once for the same event.

use crate::error::{AppError, AppResult};
use crate::models::EscrowTransaction;
use crate::services::EscrowService;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Envelope of a provider event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: WebhookObject,
}

/// Fields of the event object the handler reads; the rest is ignored
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentErrorDetail>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

/// What a delivered event did
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// `payment_intent.succeeded` processed; the escrow is HELD, or FAILED
    /// when the provider reported another status on retrieval
    EscrowConfirmed(EscrowTransaction),
    /// Payment failed or was canceled; escrow is FAILED
    EscrowFailed(EscrowTransaction),
    /// Valid event that does not apply to the escrow's current state
    Ignored { event_type: String, reason: String },
    /// Transfer or payout event recorded in the logs only
    PayoutLogged { event_type: String, reference: String },
    /// Event type this service does not consume
    Acknowledged { event_type: String },
}

pub struct WebhookHandler {
    escrows: Arc<EscrowService>,
    secret: Option<String>,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(escrows: Arc<EscrowService>, secret: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            escrows,
            secret,
            tolerance_secs,
        }
    }

    /// Verify, decode and dispatch one delivery
    pub async fn handle(&self, payload: &str, signature_header: &str) -> AppResult<WebhookOutcome> {
        self.verify(payload, signature_header, chrono::Utc::now().timestamp())?;

        let event: WebhookEvent = serde_json::from_str(payload).map_err(|e| {
            warn!("webhook: undecodable event body: {}", e);
            AppError::Validation(format!("Malformed webhook event: {}", e))
        })?;

        info!("webhook: {} ({}) for {}", event.event_type, event.id, event.data.object.id);
        self.dispatch(event).await
    }

    /// Check a `t=<unix>,v1=<hex>` signature header against `now`
    pub fn verify(&self, payload: &str, signature_header: &str, now: i64) -> AppResult<()> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| AppError::Config("STRIPE_WEBHOOK_SECRET is not set".to_string()))?;

        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            warn!("webhook: signature header without timestamp");
            AppError::Unauthorized("Missing signature timestamp".to_string())
        })?;
        if signatures.is_empty() {
            warn!("webhook: signature header without v1 signature");
            return Err(AppError::Unauthorized("Missing v1 signature".to_string()));
        }
        // `t=` is not authenticated yet and may be any i64
        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            warn!("webhook: timestamp {} outside tolerance (now {})", timestamp, now);
            return Err(AppError::Unauthorized(
                "Signature timestamp outside tolerance".to_string(),
            ));
        }

        let signed = format!("{}.{}", timestamp, payload);
        for candidate in signatures {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| AppError::Config(format!("Invalid webhook secret: {}", e)))?;
            mac.update(signed.as_bytes());
            // verify_slice compares in constant time
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }

        warn!("webhook: signature mismatch");
        Err(AppError::Unauthorized("Invalid webhook signature".to_string()))
    }

    async fn dispatch(&self, event: WebhookEvent) -> AppResult<WebhookOutcome> {
        let object = &event.data.object;

        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let escrow = self
                    .escrows
                    .confirm_escrow(&object.id)
                    .await
                    .map_err(|e| self.log_unknown_intent(&event, e))?;
                Ok(WebhookOutcome::EscrowConfirmed(escrow))
            }
            "payment_intent.payment_failed" | "payment_intent.canceled" => {
                let reason = failure_reason(&event.event_type, object);
                match self.escrows.mark_escrow_failed(&object.id, &reason).await {
                    Ok(escrow) => Ok(WebhookOutcome::EscrowFailed(escrow)),
                    Err(AppError::IllegalState(msg)) => {
                        warn!(
                            "webhook: {} for intent {} ignored: {}",
                            event.event_type, object.id, msg
                        );
                        Ok(WebhookOutcome::Ignored {
                            event_type: event.event_type.clone(),
                            reason: msg,
                        })
                    }
                    Err(e) => Err(self.log_unknown_intent(&event, e)),
                }
            }
            "transfer.created" | "transfer.paid" | "transfer.failed" | "payout.paid"
            | "payout.failed" => {
                let withdrawal = object
                    .metadata
                    .get("withdrawal_id")
                    .map(String::as_str)
                    .unwrap_or("unknown");
                if event.event_type.ends_with("failed") {
                    warn!(
                        "webhook: {} {} for withdrawal {} needs reconciliation",
                        event.event_type, object.id, withdrawal
                    );
                } else {
                    info!(
                        "webhook: {} {} for withdrawal {}",
                        event.event_type, object.id, withdrawal
                    );
                }
                Ok(WebhookOutcome::PayoutLogged {
                    event_type: event.event_type.clone(),
                    reference: object.id.clone(),
                })
            }
            other => {
                debug!("webhook: unhandled event type {}", other);
                Ok(WebhookOutcome::Acknowledged {
                    event_type: other.to_string(),
                })
            }
        }
    }

    fn log_unknown_intent(&self, event: &WebhookEvent, err: AppError) -> AppError {
        if err.is_not_found() {
            error!(
                "webhook: {} for intent {} has no local escrow",
                event.event_type, event.data.object.id
            );
        } else {
            error!(
                "webhook: {} for intent {} failed: {}",
                event.event_type, event.data.object.id, err
            );
        }
        err
    }
}

fn failure_reason(event_type: &str, object: &WebhookObject) -> String {
    if let Some(message) = object
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.as_deref())
    {
        return format!("Payment failed: {}", message);
    }
    match (event_type, object.cancellation_reason.as_deref()) {
        ("payment_intent.canceled", Some(reason)) => format!("Payment canceled: {}", reason),
        ("payment_intent.canceled", None) => "Payment canceled".to_string(),
        _ => "Payment failed".to_string(),
    }
}

/// Build a signature header for `payload`, as the provider would
pub fn sign(secret: &str, timestamp: i64, payload: &str) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}
