//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tollbooth_billing::{BillingError, QuotaRejection};
use tollbooth_shared::UsageMetric;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Billing errors
    #[error("Quota exceeded for {metric}")]
    QuotaExceeded {
        reason: QuotaRejection,
        metric: UsageMetric,
        usage: i64,
        quota: i64,
    },

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::QuotaExceeded {
            reason,
            metric,
            usage,
            quota,
        } = &self
        {
            let body = Json(json!({
                "error": {
                    "code": "QUOTA_EXCEEDED",
                    "message": self.to_string(),
                    "reason": reason,
                    "metric": metric,
                    "usage": usage,
                    "quota": quota,
                }
            }));
            return (StatusCode::PAYMENT_REQUIRED, body).into_response();
        }

        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::QuotaExceeded { .. } => (
                StatusCode::PAYMENT_REQUIRED,
                "QUOTA_EXCEEDED",
                self.to_string(),
            ),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::InvalidInput(msg) | BillingError::SignatureVerification(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::QuotaExceeded {
                reason,
                metric,
                usage,
                quota,
            } => ApiError::QuotaExceeded {
                reason,
                metric,
                usage,
                quota,
            },
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Database(msg)
            }
            BillingError::CacheUnavailable(_) | BillingError::Timeout(_) => {
                ApiError::ServiceUnavailable
            }
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
