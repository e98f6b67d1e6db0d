//! Release/refund triggers and escrow status polling.
//!
//! Release and refund are internal endpoints called by the deal-approval
//! workflow; the escrow API answers with stable status enums, so "not yet
//! funded" is a normal `pending`, not an error.

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EscrowStatus, SettlementSplit, SettlementState};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub triggered_by: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub escrow_id: Uuid,
    pub status: EscrowStatus,
    pub split: SettlementSplit,
}

pub async fn release(
    State(state): State<AppState>,
    Path(escrow_id): Path<Uuid>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let outcome = state.ledger.release(escrow_id, &payload.triggered_by).await?;

    if outcome.newly_released {
        // Disbursement retries with backoff; run it off the request path.
        let processor = state.payouts.clone();
        let escrow = outcome.escrow.clone();
        let split = outcome.split;
        tokio::spawn(async move {
            if let Err(err) = processor.disburse(&escrow, &split).await {
                tracing::error!(
                    escrow_id = %escrow.id,
                    error = %err,
                    "disbursement did not complete"
                );
            }
        });
    }

    Ok(Json(ReleaseResponse {
        escrow_id,
        status: EscrowStatus::Released,
        split: outcome.split,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub escrow_id: Uuid,
    pub status: EscrowStatus,
}

pub async fn refund(
    State(state): State<AppState>,
    Path(escrow_id): Path<Uuid>,
    Json(payload): Json<RefundRequest>,
) -> Result<Json<RefundResponse>, AppError> {
    state.ledger.refund(escrow_id, &payload.reason).await?;
    Ok(Json(RefundResponse {
        escrow_id,
        status: EscrowStatus::Refunded,
    }))
}

#[derive(Debug, Serialize)]
pub struct EscrowResponse {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    pub subject_id: Uuid,
    pub amount_minor: i64,
    pub status: EscrowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_state: Option<SettlementState>,
    pub gateway_order_id: String,
    pub created_at: String,
    pub updated_at: String,
}

pub async fn get_escrow(
    State(state): State<AppState>,
    Path(escrow_id): Path<Uuid>,
) -> Result<Json<EscrowResponse>, AppError> {
    let escrow = state
        .repository
        .get_escrow(escrow_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow!("escrow {escrow_id}")))?;

    Ok(Json(EscrowResponse {
        id: escrow.id,
        buyer_id: escrow.buyer_id,
        seller_id: escrow.seller_id,
        agent_id: escrow.agent_id,
        subject_id: escrow.subject_id,
        amount_minor: escrow.amount_minor,
        status: escrow.status,
        settlement_state: escrow.settlement_state,
        gateway_order_id: escrow.gateway_order_id,
        created_at: escrow.created_at.to_rfc3339(),
        updated_at: escrow.updated_at.to_rfc3339(),
    }))
}
