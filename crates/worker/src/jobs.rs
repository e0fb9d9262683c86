//! Scheduled pipeline jobs
//!
//! Each job runs one batch per tick. A tick that fires while the previous run
//! of the same job is still going is skipped.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tollbooth_billing::BillingPipeline;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    RetryWebhooks,
    AggregateUsage,
    SubmitUsage,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::RetryWebhooks,
        JobKind::AggregateUsage,
        JobKind::SubmitUsage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RetryWebhooks => "retry_webhooks",
            JobKind::AggregateUsage => "aggregate_usage",
            JobKind::SubmitUsage => "submit_usage",
        }
    }

    /// Cron expression, seconds first
    pub fn schedule(&self) -> &'static str {
        match self {
            JobKind::RetryWebhooks => "*/10 * * * * *",
            JobKind::AggregateUsage => "0 * * * * *",
            JobKind::SubmitUsage => "30 */5 * * * *",
        }
    }

    fn index(&self) -> usize {
        match self {
            JobKind::RetryWebhooks => 0,
            JobKind::AggregateUsage => 1,
            JobKind::SubmitUsage => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped,
    Failed,
}

pub struct JobRunner {
    pipeline: Arc<BillingPipeline>,
    running: [Mutex<()>; 3],
}

impl JobRunner {
    pub fn new(pipeline: Arc<BillingPipeline>) -> Self {
        Self {
            pipeline,
            running: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    pub async fn run(&self, kind: JobKind) -> JobOutcome {
        let Ok(_guard) = self.running[kind.index()].try_lock() else {
            debug!(job = kind.name(), "Previous run still in progress, skipping");
            return JobOutcome::Skipped;
        };

        let result = match kind {
            JobKind::RetryWebhooks => self.pipeline.retry.run_batch().await.map(|summary| {
                if summary.processed > 0 || summary.dead_lettered > 0 {
                    info!(
                        job = kind.name(),
                        processed = summary.processed,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        dead_lettered = summary.dead_lettered,
                        "Retry batch finished"
                    );
                }
            }),
            JobKind::AggregateUsage => self.pipeline.aggregator.run_once().await.map(|summary| {
                if summary.events > 0 {
                    info!(
                        job = kind.name(),
                        events = summary.events,
                        aggregates = summary.aggregates,
                        failed = summary.failed,
                        "Usage aggregation finished"
                    );
                }
            }),
            JobKind::SubmitUsage => self.pipeline.sink.run_once().await.map(|summary| {
                if summary.selected > 0 {
                    info!(
                        job = kind.name(),
                        submitted = summary.submitted,
                        skipped = summary.skipped,
                        failed = summary.failed,
                        "Usage submission finished"
                    );
                }
            }),
        };

        match result {
            Ok(()) => JobOutcome::Completed,
            Err(e) => {
                error!(job = kind.name(), error = %e, "Job failed");
                JobOutcome::Failed
            }
        }
    }
}

/// Register every job on `scheduler`
pub async fn register(
    scheduler: &JobScheduler,
    runner: Arc<JobRunner>,
) -> Result<(), JobSchedulerError> {
    for kind in JobKind::ALL {
        let runner = runner.clone();
        let job = Job::new_async(kind.schedule(), move |_id, _scheduler| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run(kind).await;
            })
        })?;
        scheduler.add(job).await?;
        info!(job = kind.name(), schedule = kind.schedule(), "Job scheduled");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use time::macros::datetime;
    use tollbooth_billing::{
        BillingResult, InMemoryStore, NewUsageEvent, PipelineStores, UsageAggregate, UsageReporter,
        UsageStore,
    };
    use tollbooth_shared::{ManualClock, TenantId, UsageMetric};

    struct CountingReporter;

    #[async_trait]
    impl UsageReporter for CountingReporter {
        async fn report(&self, aggregate: &UsageAggregate) -> BillingResult<Option<String>> {
            Ok(Some(format!("mbur_{}", aggregate.total_amount)))
        }
    }

    fn runner(store: &InMemoryStore) -> JobRunner {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let pipeline = BillingPipeline::builder(
            PipelineStores::in_memory(store),
            Arc::new(CountingReporter),
            "whsec_worker_test",
        )
        .clock(clock)
        .build()
        .unwrap();
        JobRunner::new(Arc::new(pipeline))
    }

    #[test]
    fn test_schedules_have_seconds_field() {
        for kind in JobKind::ALL {
            assert_eq!(kind.schedule().split_whitespace().count(), 6, "{}", kind.name());
        }
    }

    #[tokio::test]
    async fn test_jobs_move_usage_from_events_to_provider() {
        let store = InMemoryStore::new();
        let runner = runner(&store);
        let tenant = TenantId::new();
        store
            .set_subscription_item(tenant, UsageMetric::Tokens, "si_tokens")
            .await
            .unwrap();
        runner
            .pipeline
            .emitter
            .emit(NewUsageEvent::new(tenant, UsageMetric::Tokens, 75))
            .await;

        assert_eq!(runner.run(JobKind::AggregateUsage).await, JobOutcome::Completed);
        assert_eq!(runner.run(JobKind::SubmitUsage).await, JobOutcome::Completed);
        assert_eq!(runner.run(JobKind::RetryWebhooks).await, JobOutcome::Completed);

        let aggregates = store.aggregates().await;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].provider_reference.as_deref(), Some("mbur_75"));
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let store = InMemoryStore::new();
        let runner = runner(&store);

        let _held = runner.running[JobKind::SubmitUsage.index()].lock().await;
        assert_eq!(runner.run(JobKind::SubmitUsage).await, JobOutcome::Skipped);
        assert_eq!(runner.run(JobKind::AggregateUsage).await, JobOutcome::Completed);
    }
}
