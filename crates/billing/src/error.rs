//! Billing error types

use serde::Serialize;
use thiserror::Error;
use tollbooth_shared::UsageMetric;

/// Why a quota check rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaRejection {
    /// Plan-configured hard cap reached
    HardCap,
    /// Soft cap exceeded and the grace window has run out
    GraceExpired,
}

impl std::fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaRejection::HardCap => write!(f, "hard_cap"),
            QuotaRejection::GraceExpired => write!(f, "grace_expired"),
        }
    }
}

/// Billing pipeline errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Event processing failed: {0}")]
    Processing(String),

    #[error("Retry budget exhausted after {retry_count} attempts: {message}")]
    PermanentFailure { retry_count: i32, message: String },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Quota exceeded for {metric} ({reason}): usage {usage} of {quota}")]
    QuotaExceeded {
        reason: QuotaRejection,
        metric: UsageMetric,
        usage: i64,
        quota: i64,
    },

    #[error("Usage submission rejected by provider: {0}")]
    Submission(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same work later can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BillingError::SignatureVerification(_)
                | BillingError::PermanentFailure { .. }
                | BillingError::QuotaExceeded { .. }
                | BillingError::InvalidInput(_)
                | BillingError::Config(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::CacheUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for BillingError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        BillingError::Timeout(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_errors_are_terminal() {
        let err = BillingError::SignatureVerification("bad v1".into());
        assert!(!err.is_retryable());
        assert!(BillingError::Database("conn reset".into()).is_retryable());
        assert!(BillingError::Processing("handler failed".into()).is_retryable());
    }

    #[test]
    fn test_quota_exceeded_message() {
        let err = BillingError::QuotaExceeded {
            reason: QuotaRejection::GraceExpired,
            metric: UsageMetric::ApiCalls,
            usage: 1200,
            quota: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Quota exceeded for api_calls (grace_expired): usage 1200 of 1000"
        );
    }
}
