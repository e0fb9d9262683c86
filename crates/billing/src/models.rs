//! Persisted pipeline entities

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tollbooth_shared::{BillingPeriod, TenantId, UsageMetric};
use uuid::Uuid;

/// A provider webhook as stored by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct InboundEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub error_message: Option<String>,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    /// Lease held by whichever worker is currently dispatching this event
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_until: Option<OffsetDateTime>,
    pub dead_lettered: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl InboundEvent {
    /// Fresh, unprocessed event as written by ingestion
    pub fn received(
        provider_event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_event_id: provider_event_id.into(),
            event_type: event_type.into(),
            payload,
            processed: false,
            error_message: None,
            retry_count: 0,
            next_retry_at: None,
            claimed_until: None,
            dead_lettered: false,
            received_at,
            processed_at: None,
        }
    }

    /// Eligible for a retry batch at `now`
    pub fn is_due(&self, now: OffsetDateTime, max_retries: i32) -> bool {
        !self.processed
            && !self.dead_lettered
            && self.retry_count < max_retries
            && self.next_retry_at.map_or(true, |at| at <= now)
            && self.claimed_until.map_or(true, |until| until <= now)
    }
}

/// Snapshot of an event that exhausted automatic retries
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub inbound_event_id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub error_message: Option<String>,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub moved_at: OffsetDateTime,
}

impl DeadLetterEvent {
    pub fn snapshot(event: &InboundEvent, moved_at: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            inbound_event_id: event.id,
            provider_event_id: event.provider_event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            error_message: event.error_message.clone(),
            retry_count: event.retry_count,
            received_at: event.received_at,
            moved_at,
        }
    }

    /// Rebuild the inbound form handed to the dispatcher on replay
    pub fn to_inbound(&self) -> InboundEvent {
        InboundEvent {
            id: self.inbound_event_id,
            provider_event_id: self.provider_event_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            processed: false,
            error_message: self.error_message.clone(),
            retry_count: self.retry_count,
            next_retry_at: None,
            claimed_until: None,
            dead_lettered: true,
            received_at: self.received_at,
            processed_at: None,
        }
    }
}

/// Usage event as submitted by application code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUsageEvent {
    pub tenant_id: TenantId,
    pub metric: UsageMetric,
    pub amount: i64,
    /// Tracing correlation only, never used for deduplication
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewUsageEvent {
    pub fn new(tenant_id: TenantId, metric: UsageMetric, amount: i64) -> Self {
        Self {
            tenant_id,
            metric,
            amount,
            request_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Stored raw usage event
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct UsageEvent {
    pub id: Uuid,
    #[sqlx(try_from = "Uuid")]
    pub tenant_id: TenantId,
    pub metric: UsageMetric,
    pub amount: i64,
    pub request_id: Option<String>,
    pub metadata: serde_json::Value,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl UsageEvent {
    pub fn from_new(event: NewUsageEvent, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: event.tenant_id,
            metric: event.metric,
            amount: event.amount,
            request_id: event.request_id,
            metadata: event.metadata,
            processed: false,
            timestamp,
        }
    }
}

/// Per-period usage total for one (tenant, metric)
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct UsageAggregate {
    pub id: Uuid,
    #[sqlx(try_from = "Uuid")]
    pub tenant_id: TenantId,
    pub subscription_item_id: Option<String>,
    pub metric: UsageMetric,
    pub total_amount: i64,
    pub event_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    /// Distinguishes successive aggregates within one period once earlier ones are sealed
    pub sequence: i32,
    pub submitted_to_provider: bool,
    /// Set when the sink begins submitting; sealed aggregates accept no new events
    #[serde(with = "time::serde::rfc3339::option")]
    pub submission_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    pub provider_reference: Option<String>,
    pub idempotency_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UsageAggregate {
    pub fn open(
        tenant_id: TenantId,
        metric: UsageMetric,
        period: BillingPeriod,
        sequence: i32,
        subscription_item_id: Option<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_item_id,
            metric,
            total_amount: 0,
            event_count: 0,
            period_start: period.start,
            period_end: period.end,
            sequence,
            submitted_to_provider: false,
            submission_started_at: None,
            submitted_at: None,
            provider_reference: None,
            idempotency_key: idempotency_key_for(tenant_id, metric, period.start, sequence),
            created_at,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.submitted_to_provider || self.submission_started_at.is_some()
    }
}

/// Deterministic provider idempotency key for an aggregate identity
pub fn idempotency_key_for(
    tenant_id: TenantId,
    metric: UsageMetric,
    period_start: OffsetDateTime,
    sequence: i32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "usage:{}:{}:{}:{}",
            tenant_id,
            metric,
            period_start.unix_timestamp(),
            sequence
        )
        .as_bytes(),
    );
    format!("usage_{}", &hex::encode(hasher.finalize())[..48])
}

/// Plan-provisioned quota for one (tenant, metric, period)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageQuota {
    pub id: Uuid,
    #[sqlx(try_from = "Uuid")]
    pub tenant_id: TenantId,
    pub metric: UsageMetric,
    pub quota_amount: i64,
    /// Resolved from the tenant's plan when the quota row is provisioned
    pub hard_cap: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

impl UsageQuota {
    pub fn new(
        tenant_id: TenantId,
        metric: UsageMetric,
        quota_amount: i64,
        hard_cap: bool,
        period: BillingPeriod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            metric,
            quota_amount,
            hard_cap,
            period_start: period.start,
            period_end: period.end,
        }
    }

    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.period_start,
            end: self.period_end,
        }
    }
}

/// Soft-cap overage window
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct GracePeriod {
    pub id: Uuid,
    #[sqlx(try_from = "Uuid")]
    pub tenant_id: TenantId,
    pub metric: UsageMetric,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub quota_at_start: i64,
    pub usage_at_start: i64,
    pub notified: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl GracePeriod {
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.ended_at.is_none() && self.expires_at > now
    }
}
