//! Typed gateway webhook events.
//!
//! Each known event type is parsed into its own variant with the fields the
//! engine actually needs, validated up front. A known type with a
//! wrong-shaped payload is rejected at parse time instead of surfacing as a
//! missing-field surprise mid-handler.

use anyhow::anyhow;
use serde::Deserialize;

use crate::error::AppError;

/// Outer envelope common to every gateway event.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    /// Gateway-assigned event id, the dedup key.
    id: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// `payment.*` payload entity.
#[derive(Debug, Deserialize, Clone)]
pub struct PaymentEntity {
    pub id: String,
    pub order_id: String,
    pub amount: i64,
    pub status: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// `payout.*` payload entity.
#[derive(Debug, Deserialize, Clone)]
pub struct PayoutEntity {
    pub id: String,
    pub reference_id: String,
    pub status: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// `refund.processed` payload entity.
#[derive(Debug, Deserialize, Clone)]
pub struct RefundEntity {
    pub id: String,
    pub payment_id: String,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    PaymentCaptured(PaymentEntity),
    PaymentFailed(PaymentEntity),
    PayoutProcessed(PayoutEntity),
    PayoutFailed(PayoutEntity),
    RefundProcessed(RefundEntity),
    /// Event types the engine does not act on; acknowledged without error so
    /// the gateway does not retry-storm us.
    Unknown { event_type: String },
}

#[derive(Debug)]
pub struct ParsedWebhook {
    pub event_id: String,
    pub event_type: String,
    pub event: GatewayEvent,
}

/// Parse a signature-verified webhook body.
pub fn parse_webhook(body: &str) -> Result<ParsedWebhook, AppError> {
    let envelope: WebhookEnvelope = serde_json::from_str(body)
        .map_err(|e| AppError::InvalidRequest(anyhow!("malformed webhook envelope: {e}")))?;

    let event = match envelope.event.as_str() {
        "payment.captured" => GatewayEvent::PaymentCaptured(payment_entity(&envelope)?),
        "payment.failed" => GatewayEvent::PaymentFailed(payment_entity(&envelope)?),
        "payout.processed" => GatewayEvent::PayoutProcessed(payout_entity(&envelope)?),
        "payout.failed" => GatewayEvent::PayoutFailed(payout_entity(&envelope)?),
        "refund.processed" => GatewayEvent::RefundProcessed(refund_entity(&envelope)?),
        other => GatewayEvent::Unknown {
            event_type: other.to_string(),
        },
    };

    Ok(ParsedWebhook {
        event_id: envelope.id,
        event_type: envelope.event,
        event,
    })
}

fn payment_entity(envelope: &WebhookEnvelope) -> Result<PaymentEntity, AppError> {
    entity(envelope, "payment")
}

fn payout_entity(envelope: &WebhookEnvelope) -> Result<PayoutEntity, AppError> {
    entity(envelope, "payout")
}

fn refund_entity(envelope: &WebhookEnvelope) -> Result<RefundEntity, AppError> {
    entity(envelope, "refund")
}

fn entity<T: serde::de::DeserializeOwned>(
    envelope: &WebhookEnvelope,
    key: &str,
) -> Result<T, AppError> {
    let value = envelope
        .payload
        .get(key)
        .and_then(|v| v.get("entity"))
        .ok_or_else(|| {
            AppError::InvalidRequest(anyhow!(
                "event {} is missing payload.{}.entity",
                envelope.event,
                key
            ))
        })?;

    serde_json::from_value(value.clone()).map_err(|e| {
        AppError::InvalidRequest(anyhow!("malformed {} entity in {}: {e}", key, envelope.event))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_payment_captured() {
        let body = serde_json::json!({
            "id": "evt_1",
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_1",
                        "order_id": "order_1",
                        "amount": 1_000_000,
                        "status": "captured"
                    }
                }
            }
        })
        .to_string();

        let parsed = parse_webhook(&body).unwrap();
        assert_eq!(parsed.event_id, "evt_1");
        match parsed.event {
            GatewayEvent::PaymentCaptured(p) => {
                assert_eq!(p.id, "pay_1");
                assert_eq!(p.order_id, "order_1");
                assert_eq!(p.amount, 1_000_000);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn known_type_with_wrong_shape_is_rejected() {
        let body = serde_json::json!({
            "id": "evt_2",
            "event": "payment.captured",
            "payload": { "payment": { "entity": { "id": "pay_1" } } }
        })
        .to_string();

        assert!(matches!(
            parse_webhook(&body),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let body = serde_json::json!({
            "id": "evt_3",
            "event": "invoice.expired",
            "payload": {}
        })
        .to_string();

        let parsed = parse_webhook(&body).unwrap();
        assert!(matches!(parsed.event, GatewayEvent::Unknown { .. }));
    }

    #[test]
    fn parses_payout_failed_with_reason() {
        let body = serde_json::json!({
            "id": "evt_4",
            "event": "payout.failed",
            "payload": {
                "payout": {
                    "entity": {
                        "id": "pout_1",
                        "reference_id": "abc_seller_1",
                        "status": "failed",
                        "failure_reason": "beneficiary account blocked"
                    }
                }
            }
        })
        .to_string();

        let parsed = parse_webhook(&body).unwrap();
        match parsed.event {
            GatewayEvent::PayoutFailed(p) => {
                assert_eq!(p.reference_id, "abc_seller_1");
                assert_eq!(p.failure_reason.as_deref(), Some("beneficiary account blocked"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
