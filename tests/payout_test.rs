mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{payout_event, post_json, post_webhook, seed_acquisition, sign, spawn_app};
use escrow_service::models::{
    BeneficiaryType, PayoutRequest, PayoutStatus, SettlementSplit, SettlementState,
};
use escrow_service::services::Repository;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn seller_only_split(amount: i64) -> SettlementSplit {
    SettlementSplit {
        platform_fee: 0,
        agent_commission: 0,
        seller_net: amount,
    }
}

fn payout_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": "pout_ok",
        "reference_id": "echoed",
        "status": "queued"
    }))
}

#[tokio::test]
async fn three_transient_failures_then_success_on_fourth_reference_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(payout_ok())
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;
    app.repo
        .upsert_payout_destination(escrow.seller_id, "seller@upi")
        .await
        .unwrap();

    let submitted = app
        .state
        .payouts
        .disburse(&escrow, &seller_only_split(950_000))
        .await
        .unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].status, PayoutStatus::Processing);
    assert_eq!(submitted[0].attempt, 4);

    let payouts = app.repo.payouts_for_escrow(escrow.id).await.unwrap();
    assert_eq!(payouts.len(), 4);

    // Every attempt carries its own reference id; none are reused.
    let references: HashSet<&str> = payouts.iter().map(|p| p.reference_id.as_str()).collect();
    assert_eq!(references.len(), 4);

    let failed: Vec<_> = payouts
        .iter()
        .filter(|p| p.status == PayoutStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|p| p.last_error.is_some()));

    // Exactly one row reached processing.
    assert_eq!(
        payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Processing)
            .count(),
        1
    );
}

#[tokio::test]
async fn exhausted_submission_retries_leave_failed_rows_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;
    app.repo
        .upsert_payout_destination(escrow.seller_id, "seller@upi")
        .await
        .unwrap();

    let submitted = app
        .state
        .payouts
        .disburse(&escrow, &seller_only_split(950_000))
        .await
        .unwrap();
    assert!(submitted.is_empty());

    let payouts = app.repo.payouts_for_escrow(escrow.id).await.unwrap();
    // Initial attempt plus three retries.
    assert_eq!(payouts.len(), 4);
    assert!(payouts.iter().all(|p| p.status == PayoutStatus::Failed));
}

#[tokio::test]
async fn missing_destination_fails_immediately_without_gateway_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(payout_ok())
        .expect(0)
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;
    // No destination on file for the seller.

    let submitted = app
        .state
        .payouts
        .disburse(&escrow, &seller_only_split(950_000))
        .await
        .unwrap();
    assert!(submitted.is_empty());

    let payouts = app.repo.payouts_for_escrow(escrow.id).await.unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].status, PayoutStatus::Failed);
    assert!(payouts[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("no payout destination"));

    let stored = app.repo.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(stored.settlement_state, Some(SettlementState::Incomplete));
}

#[tokio::test]
async fn payout_failed_webhook_resubmits_under_new_reference_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(payout_ok())
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;
    app.repo
        .upsert_payout_destination(escrow.seller_id, "seller@upi")
        .await
        .unwrap();

    let submitted = app
        .state
        .payouts
        .disburse(&escrow, &seller_only_split(950_000))
        .await
        .unwrap();
    let first = &submitted[0];

    let event = payout_event(
        "payout.failed",
        "evt_pf_1",
        &first.reference_id,
        Some("bank temporarily unavailable"),
    );
    let (status, _) = post_webhook(&app.router, &event, &sign(&event)).await;
    assert_eq!(status, StatusCode::OK);

    // The resubmission runs off the webhook path.
    let mut resubmitted = None;
    for _ in 0..100 {
        let payouts = app.repo.payouts_for_escrow(escrow.id).await.unwrap();
        if let Some(p) = payouts
            .iter()
            .find(|p| p.attempt == 2 && p.status == PayoutStatus::Processing)
        {
            resubmitted = Some(p.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let resubmitted = resubmitted.expect("no resubmission appeared");
    assert_ne!(resubmitted.reference_id, first.reference_id);

    let original = app.repo.get_payout(first.id).await.unwrap().unwrap();
    assert_eq!(original.status, PayoutStatus::Failed);
    assert_eq!(
        original.last_error.as_deref(),
        Some("bank temporarily unavailable")
    );
}

#[tokio::test]
async fn attempt_cap_escalates_instead_of_resubmitting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(payout_ok())
        .expect(0)
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;

    // Five attempts already on record; the fifth is in flight.
    let now = Utc::now();
    for attempt in 1..=5u32 {
        let payout = PayoutRequest {
            id: Uuid::new_v4(),
            escrow_id: escrow.id,
            beneficiary_type: BeneficiaryType::Seller,
            amount_minor: 950_000,
            destination: "seller@upi".to_string(),
            status: if attempt == 5 {
                PayoutStatus::Processing
            } else {
                PayoutStatus::Failed
            },
            gateway_payout_id: None,
            reference_id: PayoutRequest::reference_id_for(
                escrow.id,
                BeneficiaryType::Seller,
                attempt,
            ),
            attempt,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        app.repo.insert_payout(&payout).await.unwrap();
    }

    let fifth_ref = PayoutRequest::reference_id_for(escrow.id, BeneficiaryType::Seller, 5);
    let event = payout_event("payout.failed", "evt_cap", &fifth_ref, Some("blocked"));
    let (status, _) = post_webhook(&app.router, &event, &sign(&event)).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let payouts = app.repo.payouts_for_escrow(escrow.id).await.unwrap();
    assert_eq!(payouts.len(), 5, "no sixth attempt past the cap");

    let stored = app.repo.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(stored.settlement_state, Some(SettlementState::Incomplete));
}

#[tokio::test]
async fn retry_endpoint_resubmits_failed_payouts_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payouts"))
        .respond_with(payout_ok())
        .mount(&server)
        .await;

    let app = spawn_app(&server.uri());
    let (_, escrow) = seed_acquisition(&app.repo, 1_000_000, false).await;

    let now = Utc::now();
    let failed = PayoutRequest {
        id: Uuid::new_v4(),
        escrow_id: escrow.id,
        beneficiary_type: BeneficiaryType::Seller,
        amount_minor: 950_000,
        destination: "seller@upi".to_string(),
        status: PayoutStatus::Failed,
        gateway_payout_id: None,
        reference_id: PayoutRequest::reference_id_for(escrow.id, BeneficiaryType::Seller, 1),
        attempt: 1,
        last_error: Some("payout failed at gateway".to_string()),
        created_at: now,
        updated_at: now,
    };
    app.repo.insert_payout(&failed).await.unwrap();

    let (status, body) = post_json(
        &app.router,
        &format!("/payouts/{}/retry", failed.id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "processing");
    assert_eq!(body["attempt"], 2);

    // A processing payout cannot be retried.
    let new_id = body["id"].as_str().unwrap();
    let (status, _) = post_json(
        &app.router,
        &format!("/payouts/{new_id}/retry"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
