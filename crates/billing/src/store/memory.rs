//! In-memory storage (for tests and development without Postgres)
//!
//! A single lock guards all tables, so every multi-row transition is atomic.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tollbooth_shared::{BillingPeriod, TenantId, UsageMetric};
use uuid::Uuid;

use super::{BillingEventStore, GracePeriodStore, UsageRollup, UsageStore, WebhookEventStore};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::models::{
    DeadLetterEvent, GracePeriod, InboundEvent, UsageAggregate, UsageEvent, UsageQuota,
};

#[derive(Default)]
struct Tables {
    inbound: HashMap<Uuid, InboundEvent>,
    dead_letters: HashMap<Uuid, DeadLetterEvent>,
    usage_events: Vec<UsageEvent>,
    aggregates: Vec<UsageAggregate>,
    quotas: Vec<UsageQuota>,
    subscription_items: HashMap<(TenantId, UsageMetric), String>,
    grace_periods: Vec<GracePeriod>,
    billing_events: Vec<BillingEvent>,
}

/// Process-local implementation of every store trait
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored inbound events
    pub async fn inbound_count(&self) -> usize {
        self.tables.read().await.inbound.len()
    }

    pub async fn usage_events(&self) -> Vec<UsageEvent> {
        self.tables.read().await.usage_events.clone()
    }

    pub async fn aggregates(&self) -> Vec<UsageAggregate> {
        self.tables.read().await.aggregates.clone()
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryStore {
    async fn insert_if_absent(&self, event: &InboundEvent) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .inbound
            .values()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return Ok(false);
        }
        tables.inbound.insert(event.id, event.clone());
        Ok(true)
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<InboundEvent>> {
        Ok(self.tables.read().await.inbound.get(&id).cloned())
    }

    async fn get_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<InboundEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .inbound
            .values()
            .find(|e| e.provider_event_id == provider_event_id)
            .cloned())
    }

    async fn select_due(
        &self,
        now: OffsetDateTime,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        let tables = self.tables.read().await;
        let mut due: Vec<InboundEvent> = tables
            .inbound
            .values()
            .filter(|e| e.is_due(now, max_retries))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.received_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(event) = tables.inbound.get_mut(&id) else {
            return Ok(false);
        };
        let claimable = !event.processed
            && !event.dead_lettered
            && event.retry_count == expected_retry_count
            && event.claimed_until.map_or(true, |until| until <= now);
        if claimable {
            event.claimed_until = Some(lease_until);
        }
        Ok(claimable)
    }

    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        let event = tables
            .inbound
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("inbound event {}", id)))?;
        event.processed = true;
        event.processed_at = Some(processed_at);
        event.error_message = None;
        event.claimed_until = None;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        next_retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<InboundEvent>> {
        let mut tables = self.tables.write().await;
        let Some(event) = tables.inbound.get_mut(&id) else {
            return Ok(None);
        };
        if event.processed || event.dead_lettered || event.retry_count != expected_retry_count {
            return Ok(None);
        }
        event.retry_count += 1;
        event.error_message = Some(error_message.to_string());
        event.next_retry_at = next_retry_at;
        event.claimed_until = None;
        Ok(Some(event.clone()))
    }

    async fn record_exhaustion(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        moved_at: OffsetDateTime,
    ) -> BillingResult<Option<DeadLetterEvent>> {
        let mut tables = self.tables.write().await;
        let Some(event) = tables.inbound.get_mut(&id) else {
            return Ok(None);
        };
        if event.processed || event.dead_lettered || event.retry_count != expected_retry_count {
            return Ok(None);
        }
        event.retry_count += 1;
        event.error_message = Some(error_message.to_string());
        event.next_retry_at = None;
        event.claimed_until = None;
        event.dead_lettered = true;
        let snapshot = DeadLetterEvent::snapshot(event, moved_at);
        tables.dead_letters.insert(snapshot.id, snapshot.clone());
        Ok(Some(snapshot))
    }

    async fn select_exhausted(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<InboundEvent> = tables
            .inbound
            .values()
            .filter(|e| !e.processed && !e.dead_lettered && e.retry_count >= max_retries)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.received_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn promote_to_dead_letter(&self, snapshot: &DeadLetterEvent) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        let already = tables
            .dead_letters
            .values()
            .any(|d| d.inbound_event_id == snapshot.inbound_event_id);
        let Some(event) = tables.inbound.get_mut(&snapshot.inbound_event_id) else {
            return Err(BillingError::NotFound(format!(
                "inbound event {}",
                snapshot.inbound_event_id
            )));
        };
        if already || event.dead_lettered {
            return Ok(false);
        }
        event.dead_lettered = true;
        event.claimed_until = None;
        tables.dead_letters.insert(snapshot.id, snapshot.clone());
        Ok(true)
    }

    async fn get_dead_letter(&self, id: Uuid) -> BillingResult<Option<DeadLetterEvent>> {
        Ok(self.tables.read().await.dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<DeadLetterEvent>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<DeadLetterEvent> = tables.dead_letters.values().cloned().collect();
        rows.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_dead_letter(&self, id: Uuid) -> BillingResult<bool> {
        Ok(self.tables.write().await.dead_letters.remove(&id).is_some())
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn append_usage_event(&self, event: &UsageEvent) -> BillingResult<()> {
        self.tables.write().await.usage_events.push(event.clone());
        Ok(())
    }

    async fn fetch_unprocessed_usage(&self, limit: i64) -> BillingResult<Vec<UsageEvent>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<UsageEvent> = tables
            .usage_events
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.timestamp);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn apply_rollup(
        &self,
        rollup: &UsageRollup,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>> {
        let mut tables = self.tables.write().await;

        let mut total = 0i64;
        let mut count = 0i64;
        for event in tables
            .usage_events
            .iter_mut()
            .filter(|e| !e.processed && rollup.event_ids.contains(&e.id))
        {
            event.processed = true;
            total += event.amount;
            count += 1;
        }
        if count == 0 {
            return Ok(None);
        }

        let open = tables.aggregates.iter_mut().find(|a| {
            a.tenant_id == rollup.tenant_id
                && a.metric == rollup.metric
                && a.period_start == rollup.period.start
                && !a.is_sealed()
        });
        if let Some(aggregate) = open {
            aggregate.total_amount += total;
            aggregate.event_count += count;
            return Ok(Some(aggregate.clone()));
        }

        let sequence = tables
            .aggregates
            .iter()
            .filter(|a| {
                a.tenant_id == rollup.tenant_id
                    && a.metric == rollup.metric
                    && a.period_start == rollup.period.start
            })
            .map(|a| a.sequence + 1)
            .max()
            .unwrap_or(0);
        let mut aggregate = UsageAggregate::open(
            rollup.tenant_id,
            rollup.metric,
            rollup.period,
            sequence,
            None,
            now,
        );
        aggregate.total_amount = total;
        aggregate.event_count = count;
        tables.aggregates.push(aggregate.clone());
        Ok(Some(aggregate))
    }

    async fn list_unsubmitted(&self, limit: i64) -> BillingResult<Vec<UsageAggregate>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<UsageAggregate> = tables
            .aggregates
            .iter()
            .filter(|a| !a.submitted_to_provider)
            .filter_map(|a| {
                let mut aggregate = a.clone();
                if aggregate.subscription_item_id.is_none() {
                    aggregate.subscription_item_id = tables
                        .subscription_items
                        .get(&(a.tenant_id, a.metric))
                        .cloned();
                }
                aggregate.subscription_item_id.is_some().then_some(aggregate)
            })
            .collect();
        rows.sort_by_key(|a| a.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn seal_aggregate(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>> {
        let mut tables = self.tables.write().await;
        let Tables {
            aggregates,
            subscription_items,
            ..
        } = &mut *tables;
        let Some(aggregate) = aggregates
            .iter_mut()
            .find(|a| a.id == id && !a.submitted_to_provider)
        else {
            return Ok(None);
        };
        if aggregate.submission_started_at.is_none() {
            aggregate.submission_started_at = Some(now);
        }
        if aggregate.subscription_item_id.is_none() {
            aggregate.subscription_item_id = subscription_items
                .get(&(aggregate.tenant_id, aggregate.metric))
                .cloned();
        }
        Ok(Some(aggregate.clone()))
    }

    async fn mark_submitted(
        &self,
        id: Uuid,
        provider_reference: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(aggregate) = tables
            .aggregates
            .iter_mut()
            .find(|a| a.id == id && !a.submitted_to_provider)
        else {
            return Ok(false);
        };
        aggregate.submitted_to_provider = true;
        aggregate.submitted_at = Some(now);
        aggregate.provider_reference = provider_reference.map(str::to_string);
        Ok(true)
    }

    async fn get_aggregate(&self, id: Uuid) -> BillingResult<Option<UsageAggregate>> {
        Ok(self
            .tables
            .read()
            .await
            .aggregates
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn period_usage(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        period: BillingPeriod,
    ) -> BillingResult<i64> {
        Ok(self
            .tables
            .read()
            .await
            .aggregates
            .iter()
            .filter(|a| {
                a.tenant_id == tenant_id
                    && a.metric == metric
                    && a.period_start >= period.start
                    && a.period_start < period.end
            })
            .map(|a| a.total_amount)
            .sum())
    }

    async fn current_quota(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        at: OffsetDateTime,
    ) -> BillingResult<Option<UsageQuota>> {
        Ok(self
            .tables
            .read()
            .await
            .quotas
            .iter()
            .find(|q| {
                q.tenant_id == tenant_id
                    && q.metric == metric
                    && q.period_start <= at
                    && at < q.period_end
            })
            .cloned())
    }

    async fn upsert_quota(&self, quota: &UsageQuota) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        tables.quotas.retain(|q| {
            !(q.tenant_id == quota.tenant_id
                && q.metric == quota.metric
                && q.period_start == quota.period_start)
        });
        tables.quotas.push(quota.clone());
        Ok(())
    }

    async fn subscription_item_for(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .subscription_items
            .get(&(tenant_id, metric))
            .cloned())
    }

    async fn set_subscription_item(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        subscription_item_id: &str,
    ) -> BillingResult<()> {
        self.tables
            .write()
            .await
            .subscription_items
            .insert((tenant_id, metric), subscription_item_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl GracePeriodStore for InMemoryStore {
    async fn insert_grace_period(&self, grace: &GracePeriod) -> BillingResult<()> {
        self.tables.write().await.grace_periods.push(grace.clone());
        Ok(())
    }

    async fn latest_grace_period(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<GracePeriod>> {
        // Later insertions win ties on started_at
        Ok(self
            .tables
            .read()
            .await
            .grace_periods
            .iter()
            .enumerate()
            .filter(|(_, g)| g.tenant_id == tenant_id && g.metric == metric)
            .max_by_key(|(idx, g)| (g.started_at, *idx))
            .map(|(_, g)| g.clone()))
    }

    async fn end_grace_period(&self, id: Uuid, ended_at: OffsetDateTime) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(grace) = tables.grace_periods.iter_mut().find(|g| g.id == id) {
            grace.ended_at.get_or_insert(ended_at);
        }
        Ok(())
    }

    async fn mark_grace_notified(&self, id: Uuid) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(grace) = tables.grace_periods.iter_mut().find(|g| g.id == id) {
            grace.notified = true;
        }
        Ok(())
    }
}

#[async_trait]
impl BillingEventStore for InMemoryStore {
    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .billing_events
            .iter()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return Ok(false);
        }
        tables.billing_events.push(event.clone());
        Ok(true)
    }

    async fn billing_events_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<BillingEvent> = tables
            .billing_events
            .iter()
            .filter(|e| e.tenant_id == Some(tenant_id.0))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
