//! Application configuration

use std::env;
use tollbooth_billing::{BillingError, PipelineConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis (optional; the usage cache falls back to process memory)
    pub redis_url: Option<String>,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,

    // Operator routes are disabled unless a token is configured
    pub admin_api_token: Option<String>,

    // Logging
    pub log_json: bool,

    // Retry, grace, cache and batch tuning
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Redis
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            // Stripe
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            stripe_webhook_secret: {
                let secret = env::var("STRIPE_WEBHOOK_SECRET")
                    .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?;
                if secret.trim().is_empty() {
                    return Err(ConfigError::Missing("STRIPE_WEBHOOK_SECRET"));
                }
                secret
            },

            admin_api_token: {
                let token = env::var("ADMIN_API_TOKEN").ok().filter(|t| !t.is_empty());
                if token.as_ref().is_some_and(|t| t.len() < 32) {
                    return Err(ConfigError::WeakSecret(
                        "ADMIN_API_TOKEN must be at least 32 characters",
                    ));
                }
                token
            },

            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),

            pipeline: PipelineConfig::from_env()?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid pipeline configuration: {0}")]
    Pipeline(#[from] BillingError),
}
