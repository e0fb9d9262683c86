//! Usage sink for Stripe metered billing
//!
//! Reports sealed usage aggregates to Stripe as usage records. Every request
//! carries the aggregate's deterministic idempotency key, so a run that crashes
//! between Stripe's acknowledgement and `mark_submitted` is safe to repeat.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use stripe::{CreateUsageRecord, SubscriptionItemId, UsageRecord, UsageRecordAction};
use time::OffsetDateTime;
use tollbooth_shared::Clock;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::config::PipelineConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::UsageAggregate;
use crate::store::UsageStore;

/// Sends one sealed aggregate to the payment provider
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Returns the provider's reference for the usage record, if it gives one.
    /// Must pass `aggregate.idempotency_key` through to the provider.
    async fn report(&self, aggregate: &UsageAggregate) -> BillingResult<Option<String>>;
}

/// Reports usage with `UsageRecord::create` using the increment action
pub struct StripeUsageReporter {
    stripe: StripeClient,
    clock: Arc<dyn Clock>,
}

impl StripeUsageReporter {
    pub fn new(stripe: StripeClient, clock: Arc<dyn Clock>) -> Self {
        Self { stripe, clock }
    }

    /// Stripe attributes a record to the period its timestamp falls in
    fn record_timestamp(&self, aggregate: &UsageAggregate) -> i64 {
        self.clock.now().min(period_cutoff(aggregate)).unix_timestamp()
    }
}

#[async_trait]
impl UsageReporter for StripeUsageReporter {
    async fn report(&self, aggregate: &UsageAggregate) -> BillingResult<Option<String>> {
        let item = aggregate.subscription_item_id.as_deref().ok_or_else(|| {
            BillingError::Submission(format!(
                "aggregate {} has no subscription item",
                aggregate.id
            ))
        })?;
        let item_id = item
            .parse::<SubscriptionItemId>()
            .map_err(|e| BillingError::Submission(format!("Invalid subscription item ID: {}", e)))?;
        let quantity = u64::try_from(aggregate.total_amount).map_err(|_| {
            BillingError::Submission(format!("negative usage total {}", aggregate.total_amount))
        })?;

        let params = CreateUsageRecord {
            quantity,
            action: Some(UsageRecordAction::Increment),
            timestamp: Some(self.record_timestamp(aggregate)),
        };

        let client = self.stripe.idempotent(&aggregate.idempotency_key);
        let record = UsageRecord::create(&client, &item_id, params)
            .await
            .map_err(|e| BillingError::Submission(format!("Stripe API error: {}", e)))?;

        Ok(Some(record.id.to_string()))
    }
}

/// Outcome for one aggregate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionResult {
    /// Provider acknowledged and the aggregate is marked submitted
    Submitted {
        aggregate_id: Uuid,
        quantity: i64,
        provider_reference: Option<String>,
    },
    /// Zero total, marked submitted without a provider call
    Empty { aggregate_id: Uuid },
    /// Another sink run finished it first
    AlreadySubmitted { aggregate_id: Uuid },
    /// No metered subscription item registered for the tenant and metric yet
    Unassigned { aggregate_id: Uuid },
    /// Left unsubmitted for the next run
    Failed { aggregate_id: Uuid, error: String },
}

/// Counts for one sink run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub selected: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Submits unsubmitted aggregates to the provider
pub struct UsageSink {
    store: Arc<dyn UsageStore>,
    reporter: Arc<dyn UsageReporter>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl UsageSink {
    pub fn new(
        store: Arc<dyn UsageStore>,
        reporter: Arc<dyn UsageReporter>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            reporter,
            clock,
            batch_size: config.sink_batch_size,
        }
    }

    /// Seal, report, then mark submitted. Nothing is marked before the provider
    /// acknowledges.
    pub async fn submit_aggregate(&self, aggregate_id: Uuid) -> BillingResult<SubmissionResult> {
        let sealed = match self.store.seal_aggregate(aggregate_id, self.clock.now()).await? {
            Some(sealed) => sealed,
            None => return Ok(SubmissionResult::AlreadySubmitted { aggregate_id }),
        };

        if sealed.total_amount == 0 {
            self.store.mark_submitted(aggregate_id, None, self.clock.now()).await?;
            return Ok(SubmissionResult::Empty { aggregate_id });
        }

        if sealed.subscription_item_id.is_none() {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                tenant_id = %sealed.tenant_id,
                metric = %sealed.metric,
                quantity = sealed.total_amount,
                "No metered subscription item registered, holding usage"
            );
            return Ok(SubmissionResult::Unassigned { aggregate_id });
        }

        let provider_reference = match self.reporter.report(&sealed).await {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    tenant_id = %sealed.tenant_id,
                    metric = %sealed.metric,
                    idempotency_key = %sealed.idempotency_key,
                    error = %e,
                    "Failed to report usage to Stripe"
                );
                return Ok(SubmissionResult::Failed {
                    aggregate_id,
                    error: e.to_string(),
                });
            }
        };

        let marked = self
            .store
            .mark_submitted(aggregate_id, provider_reference.as_deref(), self.clock.now())
            .await?;
        if !marked {
            return Ok(SubmissionResult::AlreadySubmitted { aggregate_id });
        }

        tracing::info!(
            aggregate_id = %aggregate_id,
            tenant_id = %sealed.tenant_id,
            metric = %sealed.metric,
            quantity = sealed.total_amount,
            "Reported usage to Stripe"
        );

        Ok(SubmissionResult::Submitted {
            aggregate_id,
            quantity: sealed.total_amount,
            provider_reference,
        })
    }

    /// Submit one batch of unsubmitted aggregates, oldest first
    pub async fn run_once(&self) -> BillingResult<SinkSummary> {
        let pending = self.store.list_unsubmitted(self.batch_size).await?;
        let mut summary = SinkSummary {
            selected: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        for aggregate in pending {
            match self.submit_aggregate(aggregate.id).await {
                Ok(SubmissionResult::Submitted { .. }) | Ok(SubmissionResult::Empty { .. }) => {
                    summary.submitted += 1
                }
                Ok(SubmissionResult::AlreadySubmitted { .. })
                | Ok(SubmissionResult::Unassigned { .. }) => summary.skipped += 1,
                Ok(SubmissionResult::Failed { .. }) => summary.failed += 1,
                Err(e) => {
                    // Provider may have the record; the same key makes the rerun safe
                    summary.failed += 1;
                    tracing::error!(
                        aggregate_id = %aggregate.id,
                        error = %e,
                        "Failed to record usage submission"
                    );
                }
            }
        }

        tracing::info!(
            selected = summary.selected,
            submitted = summary.submitted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Completed usage submission cycle"
        );

        Ok(summary)
    }
}

/// Latest moment usage can be attributed to the aggregate's period
pub fn period_cutoff(aggregate: &UsageAggregate) -> OffsetDateTime {
    aggregate.period_end - time::Duration::seconds(1)
}
