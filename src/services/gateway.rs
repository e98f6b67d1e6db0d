//! Payment gateway client.
//!
//! Wraps the gateway's Orders and Payouts APIs behind fixed-timeout HTTP
//! calls, and owns webhook signature verification. A timeout or 5xx is a
//! `TransientGateway` error so callers can retry; a 4xx is a permanent
//! rejection.

use anyhow::anyhow;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::GatewayConfig;
use crate::error::AppError;
use crate::models::BeneficiaryType;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
}

#[derive(Debug, Serialize)]
struct CreateOrderBody {
    /// Amount in smallest currency unit.
    amount: i64,
    currency: String,
    receipt: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    notes: serde_json::Value,
}

/// Gateway-side order, as returned by order creation.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize)]
struct CreatePayoutBody {
    amount: i64,
    currency: String,
    /// Idempotency key; the gateway rejects duplicate submissions under the
    /// same reference id, so transport-level retries cannot double-pay.
    reference_id: String,
    destination: String,
    beneficiary: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    narration: Option<String>,
}

/// Gateway-side payout, as returned by payout submission. A `processed`
/// status here still only means accepted; settlement is confirmed by
/// webhook.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayPayout {
    pub id: String,
    pub reference_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    code: String,
    description: String,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    pub fn key_id(&self) -> &str {
        &self.config.key_id
    }

    /// Create a remote payment order.
    pub async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: String,
        notes: serde_json::Value,
    ) -> Result<GatewayOrder, AppError> {
        let url = format!("{}/orders", self.config.api_base_url);
        let body = CreateOrderBody {
            amount: amount_minor,
            currency: currency.to_string(),
            receipt,
            notes,
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let order: GatewayOrder = read_response(response).await?;
        tracing::info!(
            gateway_order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "gateway order created"
        );
        Ok(order)
    }

    /// Submit one payout under a fresh reference id.
    pub async fn create_payout(
        &self,
        amount_minor: i64,
        currency: &str,
        reference_id: &str,
        destination: &str,
        beneficiary: BeneficiaryType,
    ) -> Result<GatewayPayout, AppError> {
        let url = format!("{}/payouts", self.config.api_base_url);
        let body = CreatePayoutBody {
            amount: amount_minor,
            currency: currency.to_string(),
            reference_id: reference_id.to_string(),
            destination: destination.to_string(),
            beneficiary: beneficiary.as_str(),
            narration: None,
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .header("X-Payout-Idempotency", reference_id)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let payout: GatewayPayout = read_response(response).await?;
        tracing::info!(
            gateway_payout_id = %payout.id,
            reference_id = %reference_id,
            amount = amount_minor,
            "payout submitted"
        );
        Ok(payout)
    }

    /// Verify a webhook signature: hex HMAC-SHA256 of the raw body under the
    /// webhook secret, compared in constant time.
    pub fn verify_webhook_signature(&self, body: &str, signature: &str) -> bool {
        let expected = compute_signature(body, self.config.webhook_secret.expose_secret());

        let expected_bytes = expected.as_bytes();
        let signature_bytes = signature.as_bytes();
        if expected_bytes.len() != signature_bytes.len() {
            return false;
        }
        expected_bytes.ct_eq(signature_bytes).into()
    }
}

fn compute_signature(payload: &str, secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Hex HMAC-SHA256 of `body`; exported for tests and tooling that need to
/// produce valid webhook signatures.
pub fn sign_body(body: &str, secret: &str) -> String {
    compute_signature(body, secret)
}

fn classify_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() || err.is_connect() {
        AppError::TransientGateway(anyhow!("gateway unreachable: {err}"))
    } else {
        AppError::TransientGateway(anyhow!("gateway transport error: {err}"))
    }
}

async fn read_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AppError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::TransientGateway(anyhow!("truncated gateway response: {e}")))?;

    if status.is_success() {
        serde_json::from_str(&body).map_err(|e| {
            AppError::InternalError(anyhow!("unparseable gateway response ({status}): {e}"))
        })
    } else if status.is_server_error() {
        tracing::warn!(status = %status, body = %body, "gateway 5xx");
        Err(AppError::TransientGateway(anyhow!("gateway {status}")))
    } else {
        let detail = serde_json::from_str::<GatewayErrorBody>(&body)
            .map(|e| format!("{}: {}", e.error.code, e.error.description))
            .unwrap_or(body);
        tracing::error!(status = %status, detail = %detail, "gateway rejected request");
        Err(AppError::GatewayRejected(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("key_secret".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_base_url: "http://localhost:0".to_string(),
            timeout_secs: 10,
        }
    }

    #[test]
    fn accepts_valid_webhook_signature() {
        let client = GatewayClient::new(test_config());
        let body = r#"{"id":"evt_1","event":"payment.captured"}"#;
        let signature = sign_body(body, "webhook_secret");
        assert!(client.verify_webhook_signature(body, &signature));
    }

    #[test]
    fn rejects_tampered_body() {
        let client = GatewayClient::new(test_config());
        let signature = sign_body(r#"{"amount":100}"#, "webhook_secret");
        assert!(!client.verify_webhook_signature(r#"{"amount":999}"#, &signature));
    }

    #[test]
    fn rejects_signature_of_wrong_length() {
        let client = GatewayClient::new(test_config());
        assert!(!client.verify_webhook_signature("body", "deadbeef"));
    }

    #[test]
    fn is_configured_requires_both_credentials() {
        assert!(GatewayClient::new(test_config()).is_configured());

        let mut config = test_config();
        config.key_id = String::new();
        assert!(!GatewayClient::new(config).is_configured());
    }
}
