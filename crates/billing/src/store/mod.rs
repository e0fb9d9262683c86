//! Storage seams for the pipeline
//!
//! Each component owns one trait. `PgStore` backs them with Postgres; `InMemoryStore`
//! backs them with process memory for tests and local development without a database.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use tollbooth_shared::{BillingPeriod, TenantId, UsageMetric};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::models::{
    DeadLetterEvent, GracePeriod, InboundEvent, UsageAggregate, UsageEvent, UsageQuota,
};

/// Inbound webhook events and their dead-letter snapshots
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Insert unless an event with the same provider id exists.
    /// Returns `false` for a duplicate delivery.
    async fn insert_if_absent(&self, event: &InboundEvent) -> BillingResult<bool>;

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<InboundEvent>>;

    async fn get_by_provider_id(&self, provider_event_id: &str)
        -> BillingResult<Option<InboundEvent>>;

    /// Unprocessed, non-dead-lettered events under the retry ceiling whose backoff
    /// and claim lease have elapsed, oldest received first
    async fn select_due(
        &self,
        now: OffsetDateTime,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>>;

    /// Conditionally take the claim lease. Succeeds only while the row is still in
    /// the state the caller selected (same retry count, lease free).
    async fn try_claim(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Mark handled, clear the error and release the lease
    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()>;

    /// Increment `retry_count` from `expected_retry_count`, store the error and the
    /// next attempt time. Returns `None` if another writer moved the row first or
    /// the row is already processed or dead-lettered.
    async fn record_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        next_retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<InboundEvent>>;

    /// Final failure: increment `retry_count` from `expected_retry_count`, store the
    /// error, snapshot the row into the dead-letter table and flag it, all as one
    /// transition. Returns `None` if another writer moved the row first.
    async fn record_exhaustion(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        moved_at: OffsetDateTime,
    ) -> BillingResult<Option<DeadLetterEvent>>;

    /// Unprocessed rows at or past the retry ceiling that never reached the
    /// dead-letter table
    async fn select_exhausted(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>>;

    /// Insert the snapshot and flag the inbound row as dead-lettered in one
    /// transition. Returns `false` if the event was already promoted.
    async fn promote_to_dead_letter(&self, snapshot: &DeadLetterEvent) -> BillingResult<bool>;

    async fn get_dead_letter(&self, id: Uuid) -> BillingResult<Option<DeadLetterEvent>>;

    async fn list_dead_letters(&self, limit: i64, offset: i64)
        -> BillingResult<Vec<DeadLetterEvent>>;

    /// Returns `false` if the row was already gone
    async fn delete_dead_letter(&self, id: Uuid) -> BillingResult<bool>;
}

/// Events claimed from the unprocessed backlog for one (tenant, metric, period)
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRollup {
    pub tenant_id: TenantId,
    pub metric: UsageMetric,
    pub period: BillingPeriod,
    pub event_ids: Vec<Uuid>,
}

/// Raw usage events, aggregates, quotas and metered subscription items
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append_usage_event(&self, event: &UsageEvent) -> BillingResult<()>;

    /// Oldest first
    async fn fetch_unprocessed_usage(&self, limit: i64) -> BillingResult<Vec<UsageEvent>>;

    /// Mark the rollup's still-unprocessed events processed and fold their amounts
    /// into the open aggregate for its period, opening one if needed. Returns `None`
    /// when a concurrent aggregator already consumed every event.
    async fn apply_rollup(
        &self,
        rollup: &UsageRollup,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>>;

    /// Unsubmitted aggregates whose tenant has a metered subscription item for the
    /// metric, oldest first. The item is resolved from the current registration
    /// when the aggregate does not carry one yet.
    async fn list_unsubmitted(&self, limit: i64) -> BillingResult<Vec<UsageAggregate>>;

    /// Seal the aggregate against further rollups and return it as sealed, copying
    /// in the registered subscription item if it has none. Re-sealing keeps the
    /// original seal and item. Returns `None` if already submitted.
    async fn seal_aggregate(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>>;

    /// Returns `false` if the aggregate was already submitted
    async fn mark_submitted(
        &self,
        id: Uuid,
        provider_reference: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn get_aggregate(&self, id: Uuid) -> BillingResult<Option<UsageAggregate>>;

    /// Sum of aggregate totals for the metric inside the period
    async fn period_usage(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        period: BillingPeriod,
    ) -> BillingResult<i64>;

    /// Quota whose period contains `at`
    async fn current_quota(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        at: OffsetDateTime,
    ) -> BillingResult<Option<UsageQuota>>;

    async fn upsert_quota(&self, quota: &UsageQuota) -> BillingResult<()>;

    async fn subscription_item_for(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<String>>;

    async fn set_subscription_item(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        subscription_item_id: &str,
    ) -> BillingResult<()>;
}

/// Grace windows. Rows are never deleted; the newest live one is the active one.
#[async_trait]
pub trait GracePeriodStore: Send + Sync {
    async fn insert_grace_period(&self, grace: &GracePeriod) -> BillingResult<()>;

    /// Most recently started window, expired or not
    async fn latest_grace_period(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<GracePeriod>>;

    async fn end_grace_period(&self, id: Uuid, ended_at: OffsetDateTime) -> BillingResult<()>;

    async fn mark_grace_notified(&self, id: Uuid) -> BillingResult<()>;
}

/// Append-only audit trail of handled provider events
#[async_trait]
pub trait BillingEventStore: Send + Sync {
    /// Returns `false` when an entry for the same provider event already exists
    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<bool>;

    async fn billing_events_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>>;
}
