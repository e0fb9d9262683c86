//! Dead-letter store
//!
//! Durable home for events that exhausted automatic retries. Promotion is one-way
//! and happens once per inbound event; the inbound row stays behind, flagged, for
//! audit. Manual replay runs the handlers directly and never re-enters the
//! backoff loop.

use serde::Serialize;
use std::sync::Arc;
use tollbooth_shared::Clock;
use uuid::Uuid;

use crate::dispatcher::EventDispatcher;
use crate::error::{BillingError, BillingResult};
use crate::models::{DeadLetterEvent, InboundEvent};
use crate::store::WebhookEventStore;

/// Result of a manual replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub dead_letter_id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub previous_error: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    store: Arc<dyn WebhookEventStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn WebhookEventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Snapshot the event and remove it from the retry set.
    /// Returns `false` if it was already promoted.
    pub async fn move_to_dead_letter(&self, event: &InboundEvent) -> BillingResult<bool> {
        let snapshot = DeadLetterEvent::snapshot(event, self.clock.now());
        let promoted = self.store.promote_to_dead_letter(&snapshot).await?;

        if promoted {
            tracing::error!(
                event_id = %event.provider_event_id,
                event_type = %event.event_type,
                retry_count = event.retry_count,
                error = ?event.error_message,
                dead_letter_id = %snapshot.id,
                "Webhook event exhausted retries, moved to dead letter"
            );
        } else {
            tracing::debug!(
                event_id = %event.provider_event_id,
                "Event already dead-lettered"
            );
        }
        Ok(promoted)
    }

    /// Record the failure that exhausts the retry budget and promote the event in
    /// the same store transition. Returns `None` if another writer moved the row.
    pub async fn record_exhaustion(
        &self,
        event: &InboundEvent,
        error_message: &str,
    ) -> BillingResult<Option<DeadLetterEvent>> {
        let promoted = self
            .store
            .record_exhaustion(event.id, event.retry_count, error_message, self.clock.now())
            .await?;

        if let Some(snapshot) = &promoted {
            tracing::error!(
                event_id = %snapshot.provider_event_id,
                event_type = %snapshot.event_type,
                retry_count = snapshot.retry_count,
                error = %error_message,
                dead_letter_id = %snapshot.id,
                "Webhook event exhausted retries, moved to dead letter"
            );
        }
        Ok(promoted)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<DeadLetterEvent>> {
        self.store.get_dead_letter(id).await
    }

    /// Newest first
    pub async fn list(&self, limit: i64, offset: i64) -> BillingResult<Vec<DeadLetterEvent>> {
        self.store.list_dead_letters(limit, offset).await
    }

    /// Re-run the handlers for a dead-lettered event
    ///
    /// On success the dead-letter row is removed and the inbound event marked
    /// processed. On failure the row is left intact and the handler error returned.
    pub async fn replay(
        &self,
        dispatcher: &EventDispatcher,
        id: Uuid,
    ) -> BillingResult<ReplayResult> {
        let dead_letter = self
            .store
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("dead letter {}", id)))?;

        tracing::info!(
            dead_letter_id = %id,
            event_id = %dead_letter.provider_event_id,
            "Replaying dead-lettered event"
        );

        if let Err(e) = dispatcher.run_handlers(&dead_letter.to_inbound()).await {
            tracing::warn!(
                dead_letter_id = %id,
                event_id = %dead_letter.provider_event_id,
                error = %e,
                "Dead letter replay failed"
            );
            return Err(e);
        }

        self.store
            .mark_processed(dead_letter.inbound_event_id, self.clock.now())
            .await?;
        if !self.store.delete_dead_letter(id).await? {
            tracing::debug!(dead_letter_id = %id, "Dead letter removed by a concurrent replay");
        }

        tracing::info!(
            dead_letter_id = %id,
            event_id = %dead_letter.provider_event_id,
            "Dead letter replay succeeded"
        );

        Ok(ReplayResult {
            dead_letter_id: id,
            provider_event_id: dead_letter.provider_event_id,
            event_type: dead_letter.event_type,
            previous_error: dead_letter.error_message,
            success: true,
            error: None,
        })
    }

    /// Replay up to `limit` dead letters, oldest promotion last
    pub async fn replay_all(
        &self,
        dispatcher: &EventDispatcher,
        limit: i64,
    ) -> BillingResult<Vec<ReplayResult>> {
        let dead_letters = self.store.list_dead_letters(limit, 0).await?;
        let mut results = Vec::with_capacity(dead_letters.len());

        for dead_letter in dead_letters {
            match self.replay(dispatcher, dead_letter.id).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(ReplayResult {
                    dead_letter_id: dead_letter.id,
                    provider_event_id: dead_letter.provider_event_id,
                    event_type: dead_letter.event_type,
                    previous_error: dead_letter.error_message,
                    success: false,
                    error: Some(e.to_string()),
                }),
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::dispatcher::tests::ScriptedHandler;
    use crate::dispatcher::EventCategory;
    use crate::store::InMemoryStore;
    use time::macros::datetime;
    use tollbooth_shared::ManualClock;

    struct Fixture {
        store: InMemoryStore,
        dead_letters: DeadLetterStore,
        dispatcher: EventDispatcher,
        event: InboundEvent,
    }

    async fn fixture(handler: Arc<ScriptedHandler>) -> Fixture {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let dead_letters = DeadLetterStore::new(Arc::new(store.clone()), clock.clone());
        let dispatcher = EventDispatcher::new(
            Arc::new(store.clone()),
            dead_letters.clone(),
            clock.clone(),
            RetryPolicy::default(),
        )
        .with_handler(EventCategory::Charge, handler);

        let mut event = InboundEvent::received(
            "evt_dead",
            "charge.failed",
            serde_json::json!({}),
            clock.now(),
        );
        event.retry_count = 5;
        event.error_message = Some("boom".into());
        store.insert_if_absent(&event).await.unwrap();

        Fixture {
            store,
            dead_letters,
            dispatcher,
            event,
        }
    }

    #[tokio::test]
    async fn test_promotion_happens_once() {
        let f = fixture(Arc::new(ScriptedHandler::default())).await;

        assert!(f.dead_letters.move_to_dead_letter(&f.event).await.unwrap());
        assert!(!f.dead_letters.move_to_dead_letter(&f.event).await.unwrap());
        assert_eq!(f.dead_letters.list(10, 0).await.unwrap().len(), 1);
        assert!(f.store.get_event(f.event.id).await.unwrap().unwrap().dead_lettered);
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_row() {
        let f = fixture(Arc::new(ScriptedHandler::failing(1))).await;
        f.dead_letters.move_to_dead_letter(&f.event).await.unwrap();
        let id = f.dead_letters.list(10, 0).await.unwrap()[0].id;

        let err = f.dead_letters.replay(&f.dispatcher, id).await.unwrap_err();

        assert!(matches!(err, BillingError::Processing(_)));
        assert!(f.dead_letters.get(id).await.unwrap().is_some());
        // Manual replay does not touch the automatic retry bookkeeping
        let inbound = f.store.get_event(f.event.id).await.unwrap().unwrap();
        assert_eq!(inbound.retry_count, 5);
        assert!(!inbound.processed);
    }

    #[tokio::test]
    async fn test_successful_replay_removes_row() {
        let f = fixture(Arc::new(ScriptedHandler::default())).await;
        f.dead_letters.move_to_dead_letter(&f.event).await.unwrap();
        let id = f.dead_letters.list(10, 0).await.unwrap()[0].id;

        let result = f.dead_letters.replay(&f.dispatcher, id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.previous_error.as_deref(), Some("boom"));
        assert!(f.dead_letters.get(id).await.unwrap().is_none());
        assert!(f.store.get_event(f.event.id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_replay_unknown_id_is_not_found() {
        let f = fixture(Arc::new(ScriptedHandler::default())).await;
        assert!(matches!(
            f.dead_letters.replay(&f.dispatcher, Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_all_reports_each_result() {
        let f = fixture(Arc::new(ScriptedHandler::failing(1))).await;
        f.dead_letters.move_to_dead_letter(&f.event).await.unwrap();

        let first = f.dead_letters.replay_all(&f.dispatcher, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].success);

        let second = f.dead_letters.replay_all(&f.dispatcher, 10).await.unwrap();
        assert!(second[0].success);
        assert!(f.dead_letters.list(10, 0).await.unwrap().is_empty());
    }
}
