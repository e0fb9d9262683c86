//! Error types shared across Tollbooth crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Invalid usage metric: {0}")]
    InvalidMetric(String),

    #[error("Invalid billing period: {0}")]
    InvalidPeriod(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
