//! Retry scheduler
//!
//! One bounded unit of work per invocation: select due events, claim each with a
//! conditional update, dispatch the ones this worker won. Selection alone never
//! grants ownership, so concurrent schedulers can share the table.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tollbooth_shared::Clock;

use crate::config::PipelineConfig;
use crate::dead_letter::DeadLetterStore;
use crate::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::error::BillingResult;
use crate::store::WebhookEventStore;

/// Counts for one retry batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryBatchSummary {
    /// Events this worker claimed and dispatched
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Selected but claimed by another worker first
    pub skipped: usize,
    /// Events promoted to the dead-letter store in this batch, including rows
    /// found at the retry ceiling without a dead letter
    pub dead_lettered: usize,
}

pub struct RetryScheduler {
    store: Arc<dyn WebhookEventStore>,
    dispatcher: Arc<EventDispatcher>,
    dead_letters: DeadLetterStore,
    clock: Arc<dyn Clock>,
    batch_size: i64,
    claim_lease: Duration,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        dispatcher: Arc<EventDispatcher>,
        dead_letters: DeadLetterStore,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            dead_letters,
            clock,
            batch_size: config.retry_batch_size,
            claim_lease: config.claim_lease,
        }
    }

    /// Process one batch of due events, oldest received first
    pub async fn run_batch(&self) -> BillingResult<RetryBatchSummary> {
        let now = self.clock.now();
        let max_retries = self.dispatcher.retry_policy().max_retries;

        let mut summary = RetryBatchSummary::default();
        summary.dead_lettered += self.promote_stranded(max_retries).await?;

        let due = self
            .store
            .select_due(now, max_retries, self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(summary);
        }

        tracing::debug!(count = due.len(), "Retry batch selected due events");

        for event in due {
            let claimed = self
                .store
                .try_claim(event.id, event.retry_count, now, now + self.claim_lease)
                .await?;
            if !claimed {
                summary.skipped += 1;
                continue;
            }

            summary.processed += 1;
            match self.dispatcher.dispatch(&event).await {
                Ok(outcome) if outcome.is_success() => summary.succeeded += 1,
                Ok(outcome) => {
                    summary.failed += 1;
                    if matches!(outcome, DispatchOutcome::DeadLettered { .. }) {
                        summary.dead_lettered += 1;
                    }
                }
                Err(e) => {
                    // The lease expires and the event becomes due again
                    summary.failed += 1;
                    tracing::error!(
                        event_id = %event.provider_event_id,
                        error = %e,
                        "Failed to record retry outcome"
                    );
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            dead_lettered = summary.dead_lettered,
            "Retry batch complete"
        );

        Ok(summary)
    }

    /// Dead-letter rows that reached the retry ceiling but never got promoted.
    /// `select_due` no longer sees them, so nothing else would.
    async fn promote_stranded(&self, max_retries: i32) -> BillingResult<usize> {
        let stranded = self
            .store
            .select_exhausted(max_retries, self.batch_size)
            .await?;

        let mut promoted = 0;
        for event in stranded {
            tracing::warn!(
                event_id = %event.provider_event_id,
                retry_count = event.retry_count,
                "Exhausted event missing from dead letters, promoting"
            );
            if self.dead_letters.move_to_dead_letter(&event).await? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::dead_letter::DeadLetterStore;
    use crate::dispatcher::tests::ScriptedHandler;
    use crate::dispatcher::EventCategory;
    use crate::models::InboundEvent;
    use crate::store::InMemoryStore;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use tollbooth_shared::ManualClock;

    fn scheduler(
        store: &InMemoryStore,
        clock: Arc<ManualClock>,
        handler: Arc<ScriptedHandler>,
    ) -> RetryScheduler {
        let dead_letters = DeadLetterStore::new(Arc::new(store.clone()), clock.clone());
        let dispatcher = EventDispatcher::new(
            Arc::new(store.clone()),
            dead_letters,
            clock.clone(),
            RetryPolicy::default(),
        )
        .with_handler(EventCategory::Invoice, handler);
        RetryScheduler::new(
            Arc::new(store.clone()),
            Arc::new(dispatcher),
            DeadLetterStore::new(Arc::new(store.clone()), clock.clone()),
            clock,
            &PipelineConfig::default(),
        )
    }

    async fn stored_event(
        store: &InMemoryStore,
        provider_id: &str,
        at: OffsetDateTime,
    ) -> InboundEvent {
        let event = InboundEvent::received(provider_id, "invoice.paid", serde_json::json!({}), at);
        store.insert_if_absent(&event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_backoff_doubles_from_current_count() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let scheduler = scheduler(&store, clock.clone(), Arc::new(ScriptedHandler::failing(10)));
        let event = stored_event(&store, "evt_1", clock.now()).await;

        for (attempt, expected_secs) in [1i64, 2, 4, 8].into_iter().enumerate() {
            let before = clock.now();
            let summary = scheduler.run_batch().await.unwrap();
            assert_eq!(summary.failed, 1, "attempt {}", attempt);

            let stored = store.get_event(event.id).await.unwrap().unwrap();
            assert_eq!(stored.retry_count, attempt as i32 + 1);
            assert_eq!(
                stored.next_retry_at,
                Some(before + time::Duration::seconds(expected_secs))
            );

            // Not due until the backoff elapses
            assert_eq!(scheduler.run_batch().await.unwrap().processed, 0);
            clock.advance(time::Duration::seconds(expected_secs));
        }
    }

    #[tokio::test]
    async fn test_fifth_failure_dead_letters() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let scheduler = scheduler(&store, clock.clone(), Arc::new(ScriptedHandler::failing(10)));
        let event = stored_event(&store, "evt_1", clock.now()).await;

        let mut dead_lettered = 0;
        for _ in 0..5 {
            dead_lettered += scheduler.run_batch().await.unwrap().dead_lettered;
            clock.advance(time::Duration::hours(1));
        }

        assert_eq!(dead_lettered, 1);
        assert_eq!(store.list_dead_letters(10, 0).await.unwrap().len(), 1);
        // Gone from every later selection
        clock.advance(time::Duration::days(1));
        assert_eq!(scheduler.run_batch().await.unwrap(), RetryBatchSummary::default());
    }

    #[tokio::test]
    async fn test_exhausted_row_without_dead_letter_is_promoted() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let handler = Arc::new(ScriptedHandler::default());
        let scheduler = scheduler(&store, clock.clone(), handler.clone());
        let event = stored_event(&store, "evt_1", clock.now()).await;

        // Five failures land but the promotion that should follow never does
        for count in 0..5 {
            store
                .record_failure(event.id, count, "downstream unavailable", Some(clock.now()))
                .await
                .unwrap()
                .unwrap();
        }
        clock.advance(time::Duration::hours(24));

        let summary = scheduler.run_batch().await.unwrap();

        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(handler.calls(), 0);
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert!(stored.dead_lettered);
        assert!(!stored.processed);
        let dead_letters = store.list_dead_letters(10, 0).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].retry_count, 5);
        assert_eq!(
            dead_letters[0].error_message.as_deref(),
            Some("downstream unavailable")
        );

        // Promoted once only
        assert_eq!(scheduler.run_batch().await.unwrap(), RetryBatchSummary::default());
    }

    #[tokio::test]
    async fn test_failure_after_dead_letter_is_ignored() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let scheduler = scheduler(&store, clock.clone(), Arc::new(ScriptedHandler::failing(10)));
        let event = stored_event(&store, "evt_1", clock.now()).await;

        for _ in 0..5 {
            scheduler.run_batch().await.unwrap();
            clock.advance(time::Duration::hours(1));
        }
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert!(stored.dead_lettered);

        // A late writer holding the final count cannot bump a dead-lettered row
        assert!(store
            .record_failure(event.id, 5, "late", None)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .record_exhaustion(event.id, 4, "late", clock.now())
            .await
            .unwrap()
            .is_none());
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 5);
        assert_eq!(store.list_dead_letters(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_event_is_skipped() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-01 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let handler = Arc::new(ScriptedHandler::default());
        let scheduler = scheduler(&store, clock.clone(), handler.clone());
        let event = stored_event(&store, "evt_1", now).await;

        // Another worker holds the lease
        assert!(store
            .try_claim(event.id, 0, now, now + time::Duration::minutes(5))
            .await
            .unwrap());

        assert_eq!(scheduler.run_batch().await.unwrap().processed, 0);
        assert_eq!(handler.calls(), 0);

        // A crashed worker's lease runs out
        clock.advance(time::Duration::minutes(5));
        let summary = scheduler.run_batch().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_bounded_and_oldest_first() {
        let store = InMemoryStore::new();
        let start = datetime!(2024-05-01 12:00 UTC);
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = scheduler(&store, clock.clone(), Arc::new(ScriptedHandler::default()));

        for i in 0..12 {
            let event = InboundEvent::received(
                format!("evt_{}", i),
                "invoice.paid",
                serde_json::json!({}),
                start + time::Duration::seconds(i),
            );
            store.insert_if_absent(&event).await.unwrap();
        }

        assert_eq!(scheduler.run_batch().await.unwrap().processed, 10);
        let newest = store.get_by_provider_id("evt_11").await.unwrap().unwrap();
        assert!(!newest.processed);
        assert_eq!(scheduler.run_batch().await.unwrap().processed, 2);
    }
}
