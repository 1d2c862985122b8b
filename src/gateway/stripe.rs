//! Stripe REST adapter (form-encoded POSTs, bearer secret key)

use super::{
    GatewayError, GatewayResult, IntentStatus, Metadata, PaymentGateway, PaymentIntent,
    TransferDestination,
};
use crate::money::to_minor_units;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(api_base: String, secret_key: String, timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
        })
    }

    fn minor_units(amount: Decimal) -> GatewayResult<String> {
        to_minor_units(amount)
            .map(|cents| cents.to_string())
            .ok_or_else(|| GatewayError::Decode(format!("amount {} is not currency-exact", amount)))
    }

    fn with_metadata(mut form: Vec<(String, String)>, metadata: &Metadata) -> Vec<(String, String)> {
        for (key, value) in metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }
        form
    }

    /// Key that makes a retried transfer a no-op at the provider
    fn transfer_idempotency_key(metadata: &Metadata) -> Option<String> {
        metadata
            .get("withdrawal_id")
            .map(|id| format!("transfer_{}", id))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> GatewayResult<T> {
        let url = format!("{}{}", self.api_base, path);
        debug!("POST {}", url);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .map(|b| {
                    let code = b.error.code.unwrap_or_default();
                    let message = b.error.message.unwrap_or_default();
                    if code.is_empty() {
                        message
                    } else {
                        format!("{} ({})", message, code)
                    }
                })
                .unwrap_or(body);
            error!("Stripe rejected request with {}: {}", status, message);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &Metadata,
    ) -> GatewayResult<PaymentIntent> {
        let form = Self::with_metadata(
            vec![
                ("amount".to_string(), Self::minor_units(amount)?),
                ("currency".to_string(), currency.to_lowercase()),
                ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
            ],
            metadata,
        );

        let intent: IntentResponse = self.post("/v1/payment_intents", &form, None).await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| GatewayError::Decode("payment intent without client_secret".to_string()))?;

        Ok(PaymentIntent {
            id: intent.id,
            client_secret,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> GatewayResult<IntentStatus> {
        let intent: IntentResponse = self
            .get(&format!("/v1/payment_intents/{}", intent_id))
            .await?;
        Ok(IntentStatus::from_str(&intent.status))
    }

    async fn create_refund(&self, intent_id: &str, reason: &str) -> GatewayResult<String> {
        let form = vec![
            ("payment_intent".to_string(), intent_id.to_string()),
            ("reason".to_string(), "requested_by_customer".to_string()),
            ("metadata[reason]".to_string(), reason.to_string()),
        ];
        let key = format!("refund_{}", intent_id);
        let refund: IdResponse = self.post("/v1/refunds", &form, Some(&key)).await?;
        Ok(refund.id)
    }

    async fn create_transfer(
        &self,
        destination: &TransferDestination,
        amount: Decimal,
        currency: &str,
        metadata: &Metadata,
    ) -> GatewayResult<String> {
        let form = Self::with_metadata(
            vec![
                ("amount".to_string(), Self::minor_units(amount)?),
                ("currency".to_string(), currency.to_lowercase()),
                ("destination".to_string(), destination.iban.clone()),
                (
                    "description".to_string(),
                    format!("Payout to {}", destination.account_holder),
                ),
            ],
            metadata,
        );
        let key = Self::transfer_idempotency_key(metadata);
        let transfer: IdResponse = self
            .post("/v1/transfers", &form, key.as_deref())
            .await?;
        Ok(transfer.id)
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_rejects_sub_cent() {
        assert_eq!(StripeGateway::minor_units(Decimal::new(1234, 2)).unwrap(), "1234");
        assert!(StripeGateway::minor_units(Decimal::new(12345, 3)).is_err());
    }

    #[test]
    fn test_metadata_is_bracketed() {
        let mut metadata = Metadata::new();
        metadata.insert("delivery_id".to_string(), "d-1".to_string());
        let form = StripeGateway::with_metadata(Vec::new(), &metadata);
        assert_eq!(
            form,
            vec![("metadata[delivery_id]".to_string(), "d-1".to_string())]
        );
    }

    #[test]
    fn test_transfer_idempotency_key_follows_withdrawal() {
        let mut metadata = Metadata::new();
        assert_eq!(StripeGateway::transfer_idempotency_key(&metadata), None);

        metadata.insert("withdrawal_id".to_string(), "w-42".to_string());
        assert_eq!(
            StripeGateway::transfer_idempotency_key(&metadata).as_deref(),
            Some("transfer_w-42")
        );
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let gateway = StripeGateway::new(
            "https://api.stripe.com/".to_string(),
            "sk_test_x".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(gateway.api_base, "https://api.stripe.com");
        assert!(!gateway.is_simulated());
    }
}
