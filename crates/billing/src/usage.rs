//! Usage metering
//!
//! `UsageEventEmitter` records raw usage events and never fails the operation
//! being metered. `UsageAggregator` periodically folds unprocessed events into
//! per-period aggregates that the sink later reports to Stripe.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tollbooth_shared::{BillingPeriod, Clock, TenantId, UsageMetric};

use crate::cache::UsageCache;
use crate::config::PipelineConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{NewUsageEvent, UsageEvent};
use crate::store::{UsageRollup, UsageStore};

/// Persists a usage event. Errors propagate; see `UsageEventEmitter` for the
/// fail-open wrapper application code should call.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, event: NewUsageEvent) -> BillingResult<UsageEvent>;
}

/// Records usage events into a `UsageStore`
pub struct StoreUsageRecorder {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
}

impl StoreUsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl UsageRecorder for StoreUsageRecorder {
    async fn record(&self, event: NewUsageEvent) -> BillingResult<UsageEvent> {
        if event.amount < 0 {
            return Err(BillingError::InvalidInput(format!(
                "usage amount must not be negative, got {}",
                event.amount
            )));
        }
        let event = UsageEvent::from_new(event, self.clock.now());
        self.store.append_usage_event(&event).await?;
        Ok(event)
    }
}

/// Fail-open front door for usage recording
#[derive(Clone)]
pub struct UsageEventEmitter {
    recorder: Arc<dyn UsageRecorder>,
}

impl UsageEventEmitter {
    pub fn new(recorder: Arc<dyn UsageRecorder>) -> Self {
        Self { recorder }
    }

    pub fn for_store(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(StoreUsageRecorder::new(store, clock)))
    }

    /// Record usage. Failures are logged and dropped.
    pub async fn emit(&self, event: NewUsageEvent) {
        let tenant_id = event.tenant_id;
        let metric = event.metric;
        let amount = event.amount;
        let request_id = event.request_id.clone();

        match self.recorder.record(event).await {
            Ok(recorded) => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    metric = %metric,
                    amount = amount,
                    usage_event_id = %recorded.id,
                    "Usage recorded"
                );
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    metric = %metric,
                    amount = amount,
                    request_id = ?request_id,
                    error = %e,
                    "Failed to record usage, dropping event"
                );
            }
        }
    }

    /// Record usage in the background without waiting on storage
    pub fn spawn_emit(&self, event: NewUsageEvent) -> JoinHandle<()> {
        let emitter = self.clone();
        tokio::spawn(async move { emitter.emit(event).await })
    }
}

/// Counts for one aggregation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    /// Unprocessed events read this run
    pub events: usize,
    /// Aggregates created or extended
    pub aggregates: usize,
    /// Groups another aggregator consumed first
    pub skipped: usize,
    pub failed: usize,
}

pub struct UsageAggregator {
    store: Arc<dyn UsageStore>,
    cache: Option<UsageCache>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Self {
        Self {
            store,
            cache: None,
            clock,
            batch_size: config.aggregation_batch_size,
        }
    }

    /// Invalidate cached usage for every (tenant, metric) a run touches
    pub fn with_cache(mut self, cache: UsageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fold one batch of unprocessed events into their period aggregates
    pub async fn run_once(&self) -> BillingResult<AggregationSummary> {
        let events = self.store.fetch_unprocessed_usage(self.batch_size).await?;
        let mut summary = AggregationSummary {
            events: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(summary);
        }

        let now = self.clock.now();
        for rollup in group_by_period(events) {
            match self.store.apply_rollup(&rollup, now).await {
                Ok(Some(aggregate)) => {
                    summary.aggregates += 1;
                    tracing::debug!(
                        tenant_id = %rollup.tenant_id,
                        metric = %rollup.metric,
                        aggregate_id = %aggregate.id,
                        total_amount = aggregate.total_amount,
                        "Usage rolled up"
                    );
                    if let Some(cache) = &self.cache {
                        cache.invalidate(rollup.tenant_id, rollup.metric).await;
                    }
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        tenant_id = %rollup.tenant_id,
                        metric = %rollup.metric,
                        events = rollup.event_ids.len(),
                        error = %e,
                        "Usage rollup failed"
                    );
                }
            }
        }

        tracing::info!(
            events = summary.events,
            aggregates = summary.aggregates,
            skipped = summary.skipped,
            failed = summary.failed,
            "Usage aggregation complete"
        );

        Ok(summary)
    }
}

/// Group events by (tenant, metric, calendar-month period of their timestamp)
fn group_by_period(events: Vec<UsageEvent>) -> Vec<UsageRollup> {
    let mut groups: BTreeMap<(TenantId, UsageMetric, OffsetDateTime), UsageRollup> =
        BTreeMap::new();
    for event in events {
        let period = BillingPeriod::containing(event.timestamp);
        groups
            .entry((event.tenant_id, event.metric, period.start))
            .or_insert_with(|| UsageRollup {
                tenant_id: event.tenant_id,
                metric: event.metric,
                period,
                event_ids: Vec::new(),
            })
            .event_ids
            .push(event.id);
    }
    groups.into_values().collect()
}
