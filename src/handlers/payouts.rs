//! Payout re-entry and inspection.

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{BeneficiaryType, PayoutRequest, PayoutStatus};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub beneficiary_type: BeneficiaryType,
    pub amount_minor: i64,
    pub status: PayoutStatus,
    pub reference_id: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_payout_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<PayoutRequest> for PayoutResponse {
    fn from(p: PayoutRequest) -> Self {
        Self {
            id: p.id,
            escrow_id: p.escrow_id,
            beneficiary_type: p.beneficiary_type,
            amount_minor: p.amount_minor,
            status: p.status,
            reference_id: p.reference_id,
            attempt: p.attempt,
            gateway_payout_id: p.gateway_payout_id,
            last_error: p.last_error,
        }
    }
}

/// Re-entry point for externally scheduled retries of a failed payout.
pub async fn retry_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> Result<(StatusCode, Json<PayoutResponse>), AppError> {
    let payout = state.payouts.retry_payout(payout_id).await?;
    Ok((StatusCode::ACCEPTED, Json(payout.into())))
}

pub async fn get_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> Result<Json<PayoutResponse>, AppError> {
    let payout = state
        .repository
        .get_payout(payout_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow!("payout {payout_id}")))?;
    Ok(Json(payout.into()))
}

/// All payout rows for an escrow, including superseded failed attempts; the
/// attempt history stays visible.
pub async fn list_escrow_payouts(
    State(state): State<AppState>,
    Path(escrow_id): Path<Uuid>,
) -> Result<Json<Vec<PayoutResponse>>, AppError> {
    let payouts = state.repository.payouts_for_escrow(escrow_id).await?;
    Ok(Json(payouts.into_iter().map(Into::into).collect()))
}
