//! Order intake.
//!
//! Creates the gateway-side order plus the local `PaymentOrder` record, and
//! for acquisitions the linked `EscrowTransaction` in the same storage
//! transaction.

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;
use crate::models::{
    EscrowStatus, EscrowTransaction, OrderStatus, PaymentOrder, PaymentPurpose,
};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub buyer_id: Uuid,
    /// Smallest currency unit; must be positive.
    #[validate(range(min = 1))]
    pub amount_minor: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub purpose: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Required when `purpose = acquisition`.
    pub seller_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    /// The business/listing under transaction; required for acquisitions.
    pub subject_id: Option<Uuid>,
}

fn default_currency() -> String {
    "INR".to_string()
}

#[derive(Debug, Serialize)]
pub struct CheckoutPayload {
    pub gateway_order_id: String,
    pub key_id: String,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<Uuid>,
    pub checkout: CheckoutPayload,
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    payload.validate()?;

    let purpose = PaymentPurpose::parse(&payload.purpose)
        .ok_or_else(|| AppError::InvalidRequest(anyhow!("unknown purpose {}", payload.purpose)))?;

    let (seller_id, subject_id) = if purpose == PaymentPurpose::Acquisition {
        let seller_id = payload
            .seller_id
            .ok_or_else(|| AppError::InvalidRequest(anyhow!("acquisition requires seller_id")))?;
        let subject_id = payload
            .subject_id
            .ok_or_else(|| AppError::InvalidRequest(anyhow!("acquisition requires subject_id")))?;
        (Some(seller_id), Some(subject_id))
    } else {
        (None, None)
    };

    let receipt = format!(
        "{}_{}_{}",
        purpose.as_str(),
        payload.buyer_id,
        Utc::now().timestamp()
    );

    let gateway_order = state
        .gateway
        .create_order(
            payload.amount_minor,
            &payload.currency,
            receipt.clone(),
            payload.metadata.clone(),
        )
        .await?;

    let now = Utc::now();
    let order = PaymentOrder {
        id: Uuid::new_v4(),
        gateway_order_id: gateway_order.id.clone(),
        buyer_id: payload.buyer_id,
        amount_minor: payload.amount_minor,
        currency: payload.currency.clone(),
        receipt,
        status: OrderStatus::Created,
        purpose,
        metadata: payload.metadata,
        created_at: now,
        updated_at: now,
    };

    let escrow = seller_id.map(|seller_id| EscrowTransaction {
        id: Uuid::new_v4(),
        buyer_id: payload.buyer_id,
        seller_id,
        agent_id: payload.agent_id,
        subject_id: subject_id.expect("subject checked with seller"),
        amount_minor: payload.amount_minor,
        status: EscrowStatus::Pending,
        gateway_order_id: gateway_order.id.clone(),
        gateway_payment_id: None,
        settlement_state: None,
        created_at: now,
        updated_at: now,
    });

    state
        .repository
        .create_order_with_escrow(&order, escrow.as_ref())
        .await?;

    tracing::info!(
        order_id = %order.id,
        gateway_order_id = %gateway_order.id,
        purpose = purpose.as_str(),
        amount_minor = payload.amount_minor,
        escrow_id = ?escrow.as_ref().map(|e| e.id),
        "payment order created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: order.id,
            escrow_id: escrow.map(|e| e.id),
            checkout: CheckoutPayload {
                gateway_order_id: gateway_order.id,
                key_id: state.gateway.key_id().to_string(),
                amount_minor: payload.amount_minor,
                currency: payload.currency,
            },
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub gateway_order_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: crate::models::OrderStatus,
    pub purpose: PaymentPurpose,
    pub created_at: String,
    pub updated_at: String,
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state
        .repository
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow!("order {order_id}")))?;

    Ok(Json(OrderResponse {
        id: order.id,
        gateway_order_id: order.gateway_order_id,
        amount_minor: order.amount_minor,
        currency: order.currency,
        status: order.status,
        purpose: order.purpose,
        created_at: order.created_at.to_rfc3339(),
        updated_at: order.updated_at.to_rfc3339(),
    }))
}
