//! Hermetic test harness: the real router and engine wired to the in-memory
//! repository, with wiremock standing in for the payment gateway.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use escrow_service::config::{
    Config, DatabaseConfig, GatewayConfig, PayoutRetryConfig, ServerConfig, SettlementConfig,
};
use escrow_service::models::{
    EscrowStatus, EscrowTransaction, OrderStatus, PaymentOrder, PaymentPurpose,
};
use escrow_service::services::gateway::sign_body;
use escrow_service::services::{MemoryRepository, Repository};
use escrow_service::{router, AppState};
use secrecy::Secret;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const PLATFORM_DESTINATION: &str = "platform@icici";

pub struct TestApp {
    pub router: Router,
    pub repo: MemoryRepository,
    pub state: AppState,
}

pub fn test_config(gateway_base_url: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            url: Secret::new("postgres://unused".to_string()),
            max_connections: 1,
        },
        gateway: GatewayConfig {
            key_id: "test_key_id".to_string(),
            key_secret: Secret::new("test_key_secret".to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: gateway_base_url.to_string(),
            timeout_secs: 5,
        },
        settlement: SettlementConfig {
            platform_fee_bps: 200,
            agent_commission_bps: 300,
            platform_destination: PLATFORM_DESTINATION.to_string(),
        },
        payout: PayoutRetryConfig {
            max_submission_retries: 3,
            max_total_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        service_name: "escrow-service-test".to_string(),
    }
}

pub fn spawn_app(gateway_base_url: &str) -> TestApp {
    let repo = MemoryRepository::new();
    let state = AppState::new(test_config(gateway_base_url), Arc::new(repo.clone()));
    TestApp {
        router: router(state.clone()),
        repo,
        state,
    }
}

pub fn sign(body: &str) -> String {
    sign_body(body, WEBHOOK_SECRET)
}

pub async fn post_json(
    router: &Router,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

pub async fn post_webhook(
    router: &Router,
    body: &str,
    signature: &str,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/gateway")
        .header("content-type", "application/json")
        .header("X-Gateway-Signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

pub async fn get(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    send(router, request).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Seed an acquisition order plus its pending escrow directly into the
/// repository, skipping gateway order creation.
pub async fn seed_acquisition(
    repo: &MemoryRepository,
    amount_minor: i64,
    with_agent: bool,
) -> (PaymentOrder, EscrowTransaction) {
    let now = Utc::now();
    let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
    let escrow = EscrowTransaction {
        id: Uuid::new_v4(),
        buyer_id: Uuid::new_v4(),
        seller_id: Uuid::new_v4(),
        agent_id: with_agent.then(Uuid::new_v4),
        subject_id: Uuid::new_v4(),
        amount_minor,
        status: EscrowStatus::Pending,
        gateway_order_id: gateway_order_id.clone(),
        gateway_payment_id: None,
        settlement_state: None,
        created_at: now,
        updated_at: now,
    };
    let order = PaymentOrder {
        id: Uuid::new_v4(),
        gateway_order_id,
        buyer_id: escrow.buyer_id,
        amount_minor,
        currency: "INR".to_string(),
        receipt: format!("acquisition_{}_{}", escrow.buyer_id, now.timestamp()),
        status: OrderStatus::Created,
        purpose: PaymentPurpose::Acquisition,
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    };
    repo.create_order_with_escrow(&order, Some(&escrow))
        .await
        .unwrap();
    (order, escrow)
}

pub fn payment_captured_event(event_id: &str, order_id: &str, payment_id: &str, amount: i64) -> String {
    serde_json::json!({
        "id": event_id,
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": order_id,
                    "amount": amount,
                    "status": "captured"
                }
            }
        }
    })
    .to_string()
}

pub fn payout_event(event_type: &str, event_id: &str, reference_id: &str, reason: Option<&str>) -> String {
    serde_json::json!({
        "id": event_id,
        "event": event_type,
        "payload": {
            "payout": {
                "entity": {
                    "id": format!("pout_{event_id}"),
                    "reference_id": reference_id,
                    "status": if event_type == "payout.processed" { "processed" } else { "failed" },
                    "failure_reason": reason
                }
            }
        }
    })
    .to_string()
}
