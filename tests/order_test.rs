mod common;

use axum::http::StatusCode;
use common::{get, post_json, spawn_app};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn gateway_with_order(gateway_order_id: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": gateway_order_id,
            "amount": 1_000_000,
            "currency": "INR",
            "receipt": null,
            "status": "created"
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn acquisition_order_creates_linked_pending_escrow() {
    let server = gateway_with_order("order_gw_1").await;
    let app = spawn_app(&server.uri());

    let (status, body) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 1_000_000,
            "purpose": "acquisition",
            "seller_id": Uuid::new_v4(),
            "agent_id": Uuid::new_v4(),
            "subject_id": Uuid::new_v4(),
            "metadata": {"deal": "d-42"}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["checkout"]["gateway_order_id"], "order_gw_1");
    assert_eq!(body["checkout"]["key_id"], "test_key_id");

    let escrow_id = body["escrow_id"].as_str().expect("escrow_id present");
    let (status, escrow) = get(&app.router, &format!("/escrow/{escrow_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(escrow["status"], "pending");
    assert_eq!(escrow["amount_minor"], 1_000_000);
    assert_eq!(escrow["gateway_order_id"], "order_gw_1");
}

#[tokio::test]
async fn subscription_order_has_no_escrow_leg() {
    let server = gateway_with_order("order_gw_2").await;
    let app = spawn_app(&server.uri());

    let (status, body) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 49_900,
            "purpose": "subscription"
        }),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(body["escrow_id"].is_null());

    let order_id = body["order_id"].as_str().unwrap();
    let (status, order) = get(&app.router, &format!("/orders/{order_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "created");
    assert_eq!(order["purpose"], "subscription");
}

#[tokio::test]
async fn zero_amount_is_rejected() {
    let server = gateway_with_order("order_gw_3").await;
    let app = spawn_app(&server.uri());

    let (status, _) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 0,
            "purpose": "valuation"
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    // Nothing should have reached the gateway.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_purpose_is_rejected() {
    let server = gateway_with_order("order_gw_4").await;
    let app = spawn_app(&server.uri());

    let (status, body) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 1000,
            "purpose": "donation"
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("purpose"));
}

#[tokio::test]
async fn acquisition_without_seller_is_rejected() {
    let server = gateway_with_order("order_gw_5").await;
    let app = spawn_app(&server.uri());

    let (status, _) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 1_000_000,
            "purpose": "acquisition",
            "subject_id": Uuid::new_v4()
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gateway_5xx_surfaces_as_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let app = spawn_app(&server.uri());

    let (status, _) = post_json(
        &app.router,
        "/orders",
        serde_json::json!({
            "buyer_id": Uuid::new_v4(),
            "amount_minor": 1000,
            "purpose": "valuation"
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}
