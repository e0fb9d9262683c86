//! Common types used across Tollbooth

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time};
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Usage Metrics
// =============================================================================

/// Billable usage dimensions
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    /// LLM tokens consumed
    Tokens,
    /// Metered API calls
    ApiCalls,
    /// Stored bytes
    Storage,
    /// Billable seats
    Seats,
}

impl UsageMetric {
    /// Every tracked metric, in display order
    pub const ALL: [UsageMetric; 4] = [
        UsageMetric::Tokens,
        UsageMetric::ApiCalls,
        UsageMetric::Storage,
        UsageMetric::Seats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::ApiCalls => "api_calls",
            Self::Storage => "storage",
            Self::Seats => "seats",
        }
    }
}

impl std::fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UsageMetric {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tokens" => Ok(Self::Tokens),
            "api_calls" => Ok(Self::ApiCalls),
            "storage" => Ok(Self::Storage),
            "seats" => Ok(Self::Seats),
            _ => Err(SharedError::InvalidMetric(s.to_string())),
        }
    }
}

// =============================================================================
// Billing Periods
// =============================================================================

/// Half-open billing window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, SharedError> {
        if end <= start {
            return Err(SharedError::InvalidPeriod(format!(
                "period end {} is not after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Calendar month (UTC) containing `at`
    pub fn containing(at: OffsetDateTime) -> Self {
        let at = at.to_offset(time::UtcOffset::UTC);
        let start = month_start(at.year(), at.month());
        let (next_year, next_month) = match at.month() {
            Month::December => (at.year() + 1, Month::January),
            m => (at.year(), m.next()),
        };
        let end = month_start(next_year, next_month);
        Self { start, end }
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start && at < self.end
    }
}

fn month_start(year: i32, month: Month) -> OffsetDateTime {
    // Day 1 exists in every month, so this only fails for years outside time's range
    Date::from_calendar_date(year, month, 1)
        .map(|d| d.with_time(Time::MIDNIGHT).assume_utc())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
