use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid request: {0}")]
    InvalidRequest(anyhow::Error),

    #[error("Webhook signature mismatch")]
    SignatureMismatch,

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Escrow is not funded")]
    EscrowNotFunded,

    #[error("Escrow is in terminal state {current}, cannot transition to {requested}")]
    TerminalStateViolation { current: String, requested: String },

    #[error("Escrow already funded by a different payment: have {existing}, got {incoming}")]
    ConflictingPayment { existing: String, incoming: String },

    #[error("Recomputed settlement split differs from the persisted one")]
    SplitMismatch,

    #[error("Beneficiary has no payout destination on file: {0}")]
    MissingBeneficiaryDetails(String),

    #[error("Transient gateway failure: {0}")]
    TransientGateway(anyhow::Error),

    #[error("Gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// Transient failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientGateway(_))
    }

    /// Integrity violations that no redelivery can ever resolve.
    pub fn is_permanent_integrity_violation(&self) -> bool {
        matches!(
            self,
            AppError::ConflictingPayment { .. }
                | AppError::TerminalStateViolation { .. }
                | AppError::SplitMismatch
        )
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details) = match self {
            AppError::ValidationError(err) => (
                StatusCode::BAD_REQUEST,
                "Invalid request".to_string(),
                Some(err.to_string()),
            ),
            AppError::InvalidRequest(err) => {
                (StatusCode::BAD_REQUEST, err.to_string(), None)
            }
            AppError::SignatureMismatch => (
                StatusCode::BAD_REQUEST,
                "Invalid webhook signature".to_string(),
                None,
            ),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None),
            err @ AppError::EscrowNotFunded => {
                (StatusCode::CONFLICT, err.to_string(), None)
            }
            err @ AppError::TerminalStateViolation { .. } => {
                (StatusCode::CONFLICT, err.to_string(), None)
            }
            err @ AppError::ConflictingPayment { .. } => {
                (StatusCode::CONFLICT, err.to_string(), None)
            }
            err @ AppError::SplitMismatch => (StatusCode::CONFLICT, err.to_string(), None),
            err @ AppError::MissingBeneficiaryDetails(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string(), None)
            }
            AppError::TransientGateway(err) => (
                StatusCode::BAD_GATEWAY,
                "Payment gateway unavailable".to_string(),
                Some(err.to_string()),
            ),
            AppError::GatewayRejected(msg) => {
                (StatusCode::BAD_GATEWAY, msg, None)
            }
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
            ),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(err.to_string()),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}
