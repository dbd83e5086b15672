//! Unified HTTP error type.
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl
//! renders the `{success: false, error, message?}` envelope. Dependency
//! failures are logged with context and collapse to a generic 500 — stack
//! traces and driver messages never reach the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use ax_store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid payload.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid credential.
    #[error("{0}")]
    Unauthorized(String),

    /// The caller's role lacks the capability.
    #[error("{0}")]
    Forbidden(String),

    /// A plan quota was hit; carries the numbers the dashboard renders.
    #[error("plan limit exceeded")]
    PlanLimit { limit: u64, current: u64 },

    /// Lookup missed within the caller's org — the uniform cross-tenant
    /// response.
    #[error("{0}")]
    NotFound(String),

    /// Unique-key collision.
    #[error("{0}")]
    Conflict(String),

    /// Rate tier exhausted.
    #[error("{0}")]
    RateLimited(String),

    /// Dependency failure; detail is logged, not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::PlanLimit { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("Resource not found".into()),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::PlanLimit { limit, current } => Json(json!({
                "success": false,
                "error": "Plan limit exceeded",
                "limit": limit,
                "current": current,
            })),
            ApiError::Internal(detail) => {
                error!(detail = %detail, "request failed with internal error");
                Json(json!({
                    "success": false,
                    "error": "Internal server error",
                }))
            }
            other => Json(json!({
                "success": false,
                "error": other.to_string(),
            })),
        };

        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
