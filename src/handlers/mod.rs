//! HTTP surface of the escrow engine.

pub mod escrow;
pub mod orders;
pub mod payouts;
pub mod webhooks;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::metrics::render_metrics;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "escrow-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_metrics(),
    )
}
