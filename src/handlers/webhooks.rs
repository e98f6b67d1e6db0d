//! Gateway webhook endpoint.
//!
//! The only untrusted entry point: nothing in the body is believed until the
//! signature over the raw bytes checks out. Events are deduplicated by
//! gateway event id; handlers are idempotent, so redelivery (including
//! reprocessing after a handler failure) is safe.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;

use crate::error::AppError;
use crate::models::WebhookEventRecord;
use crate::services::events::{parse_webhook, GatewayEvent};
use crate::services::ledger::FundingOutcome;
use crate::services::repository::EventDisposition;
use crate::AppState;

pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get("X-Gateway-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("webhook without X-Gateway-Signature header");
            AppError::SignatureMismatch
        })?;

    if !state.gateway.verify_webhook_signature(&body, signature) {
        // Security event: either a forgery attempt or a secret mismatch.
        tracing::warn!("webhook signature verification failed, rejecting");
        metrics::counter!("webhook_events_total", "result" => "bad_signature").increment(1);
        return Err(AppError::SignatureMismatch);
    }

    let parsed = parse_webhook(&body)?;

    let record = WebhookEventRecord {
        event_id: parsed.event_id.clone(),
        event_type: parsed.event_type.clone(),
        received_at: Utc::now(),
        processed: false,
    };
    match state.repository.begin_webhook_event(&record).await? {
        EventDisposition::AlreadyProcessed => {
            tracing::debug!(event_id = %parsed.event_id, "replayed webhook, acknowledging");
            metrics::counter!("webhook_events_total", "result" => "replay").increment(1);
            return Ok(StatusCode::OK);
        }
        EventDisposition::RetryPending => {
            tracing::info!(event_id = %parsed.event_id, "reprocessing webhook after earlier failure");
        }
        EventDisposition::New => {}
    }

    tracing::info!(
        event_id = %parsed.event_id,
        event_type = %parsed.event_type,
        "processing gateway webhook"
    );
    metrics::counter!("webhook_events_total", "result" => "processed").increment(1);

    // A failure here normally leaves the event row unprocessed so the
    // gateway's next retry runs the (idempotent) handler again. Permanent
    // integrity violations are the exception: redelivery can never resolve
    // them, so the event is marked processed and the error surfaced once.
    if let Err(err) = dispatch(&state, parsed.event).await {
        if err.is_permanent_integrity_violation() {
            state
                .repository
                .mark_webhook_processed(&parsed.event_id)
                .await?;
        }
        return Err(err);
    }

    state
        .repository
        .mark_webhook_processed(&parsed.event_id)
        .await?;

    Ok(StatusCode::OK)
}

async fn dispatch(state: &AppState, event: GatewayEvent) -> Result<(), AppError> {
    match event {
        GatewayEvent::PaymentCaptured(payment) => {
            match state.ledger.mark_funded(&payment.order_id, &payment.id).await {
                Ok(FundingOutcome::Funded(_)) | Ok(FundingOutcome::AlreadyFunded) => Ok(()),
                // Orders without an escrow leg (subscription, valuation,
                // matchmaking) still flip to paid.
                Err(AppError::NotFound(_)) => {
                    state.repository.persist_order_paid(&payment.order_id).await
                }
                Err(err) => Err(err),
            }
        }
        GatewayEvent::PaymentFailed(payment) => {
            tracing::info!(
                gateway_order_id = %payment.order_id,
                reason = payment.error_description.as_deref().unwrap_or("unknown"),
                "payment failed"
            );
            state
                .repository
                .persist_payment_failed(&payment.order_id)
                .await
        }
        GatewayEvent::PayoutProcessed(payout) => state.payouts.reconcile_processed(&payout).await,
        GatewayEvent::PayoutFailed(payout) => {
            if let Some(failed) = state.payouts.reconcile_failed(&payout).await? {
                // Resubmission backs off between attempts; run it off the
                // webhook response path. Attempts are persisted, so a crash
                // here is recovered through the retry endpoint.
                let processor = state.payouts.clone();
                tokio::spawn(async move {
                    if let Err(err) = processor.resubmit(&failed).await {
                        tracing::warn!(
                            payout_id = %failed.id,
                            error = %err,
                            "payout resubmission after gateway failure did not complete"
                        );
                    }
                });
            }
            Ok(())
        }
        GatewayEvent::RefundProcessed(refund) => {
            match state
                .repository
                .get_escrow_by_payment_id(&refund.payment_id)
                .await?
            {
                Some(escrow) => state
                    .ledger
                    .refund(escrow.id, "gateway refund processed")
                    .await
                    .map(|_| ()),
                None => {
                    tracing::warn!(
                        payment_id = %refund.payment_id,
                        "refund.processed for unknown payment, ignoring"
                    );
                    Ok(())
                }
            }
        }
        GatewayEvent::Unknown { event_type } => {
            tracing::info!(event_type = %event_type, "unhandled webhook event type, acknowledging");
            Ok(())
        }
    }
}
