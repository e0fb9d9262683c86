//! Pipeline configuration
//!
//! Every tunable is read from the environment with a default:
//! - `RETRY_INITIAL_BACKOFF_SECS` (1), `RETRY_MAX_BACKOFF_SECS` (3600),
//!   `RETRY_MAX_RETRIES` (5), `RETRY_BATCH_SIZE` (10), `RETRY_CLAIM_LEASE_SECS` (300)
//! - `GRACE_PERIOD_SECS` (72h)
//! - `USAGE_CACHE_TTL_SECS` (60)
//! - `QUOTA_WARNING_PERCENT` (95)
//! - `AGGREGATION_BATCH_SIZE` (1000), `SINK_BATCH_SIZE` (50)
//! - `WEBHOOK_TOLERANCE_SECS` (300), `INGEST_TIMEOUT_MS` (5000)

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Backoff policy for failed inbound events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(initial * 2^retry_count, max)`
    pub fn backoff_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

/// Configuration for every pipeline component
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    /// Events selected per retry batch
    pub retry_batch_size: i64,
    /// How long a claimed event stays invisible to other retry workers
    pub claim_lease: Duration,
    /// Length of a soft-cap grace window
    pub grace_period: Duration,
    /// Usage/quota cache entry lifetime
    pub cache_ttl: Duration,
    /// Usage percentage at which the warning header is attached
    pub warning_percent: f64,
    pub aggregation_batch_size: i64,
    pub sink_batch_size: i64,
    /// Accepted clock skew for webhook signature timestamps
    pub webhook_tolerance: Duration,
    /// Upper bound on signature verification plus persistence
    pub ingest_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_batch_size: 10,
            claim_lease: Duration::from_secs(300),
            grace_period: Duration::from_secs(72 * 3600),
            cache_ttl: Duration::from_secs(60),
            warning_percent: 95.0,
            aggregation_batch_size: 1000,
            sink_batch_size: 50,
            webhook_tolerance: Duration::from_secs(300),
            ingest_timeout: Duration::from_millis(5000),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let config = Self {
            retry: RetryPolicy {
                initial_backoff: env_secs(
                    "RETRY_INITIAL_BACKOFF_SECS",
                    defaults.retry.initial_backoff,
                )?,
                max_backoff: env_secs("RETRY_MAX_BACKOFF_SECS", defaults.retry.max_backoff)?,
                max_retries: env_parse("RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
            },
            retry_batch_size: env_parse("RETRY_BATCH_SIZE", defaults.retry_batch_size)?,
            claim_lease: env_secs("RETRY_CLAIM_LEASE_SECS", defaults.claim_lease)?,
            grace_period: env_secs("GRACE_PERIOD_SECS", defaults.grace_period)?,
            cache_ttl: env_secs("USAGE_CACHE_TTL_SECS", defaults.cache_ttl)?,
            warning_percent: env_parse("QUOTA_WARNING_PERCENT", defaults.warning_percent)?,
            aggregation_batch_size: env_parse(
                "AGGREGATION_BATCH_SIZE",
                defaults.aggregation_batch_size,
            )?,
            sink_batch_size: env_parse("SINK_BATCH_SIZE", defaults.sink_batch_size)?,
            webhook_tolerance: env_secs("WEBHOOK_TOLERANCE_SECS", defaults.webhook_tolerance)?,
            ingest_timeout: Duration::from_millis(env_parse(
                "INGEST_TIMEOUT_MS",
                defaults.ingest_timeout.as_millis() as u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.retry.max_retries < 1 {
            return Err(BillingError::Config("RETRY_MAX_RETRIES must be at least 1".into()));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(BillingError::Config(
                "RETRY_INITIAL_BACKOFF_SECS exceeds RETRY_MAX_BACKOFF_SECS".into(),
            ));
        }
        if self.retry_batch_size < 1
            || self.aggregation_batch_size < 1
            || self.sink_batch_size < 1
        {
            return Err(BillingError::Config("batch sizes must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.warning_percent) {
            return Err(BillingError::Config("QUOTA_WARNING_PERCENT must be within 0-100".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> BillingResult<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..5).map(|n| policy.backoff_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(12), Duration::from_secs(3600));
        assert_eq!(policy.backoff_for(400), Duration::from_secs(3600));
    }

    #[test]
    fn test_exhaustion_at_max_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = PipelineConfig::default();
        config.retry.initial_backoff = Duration::from_secs(7200);
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }
}
