//! Event dispatch
//!
//! Routes a stored inbound event to the handler registered for its category and
//! records the outcome. Failures are rescheduled with exponential backoff from the
//! event's current retry count; the attempt that exhausts the retry budget
//! records the failure and promotes the event to the dead-letter store in one
//! store transition.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tollbooth_shared::Clock;

use crate::config::RetryPolicy;
use crate::dead_letter::DeadLetterStore;
use crate::error::{BillingError, BillingResult};
use crate::models::InboundEvent;
use crate::store::WebhookEventStore;

/// Handles one category of provider events. Must be idempotent and tolerate
/// events arriving in any order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> BillingResult<()>;
}

/// Handler table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Invoice,
    Payment,
    Subscription,
    Charge,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Invoice,
        EventCategory::Payment,
        EventCategory::Subscription,
        EventCategory::Charge,
    ];

    /// Category for a provider event type, `None` for types nobody handles
    pub fn for_event_type(event_type: &str) -> Option<Self> {
        if event_type.starts_with("invoice.") {
            Some(EventCategory::Invoice)
        } else if event_type.starts_with("payment_intent.") {
            Some(EventCategory::Payment)
        } else if event_type.starts_with("customer.subscription.") {
            Some(EventCategory::Subscription)
        } else if event_type.starts_with("charge.") {
            Some(EventCategory::Charge)
        } else {
            None
        }
    }
}

/// What a dispatch attempt did to the event
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handler succeeded
    Processed,
    /// No handler for this type; marked processed so it leaves the queue
    Unhandled,
    /// Handler failed and the event was rescheduled
    Rescheduled {
        retry_count: i32,
        next_retry_at: OffsetDateTime,
    },
    /// Handler failed for the last time and the event was dead-lettered
    DeadLettered { retry_count: i32 },
    /// Another worker moved the event first; nothing was recorded
    Superseded,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Processed | DispatchOutcome::Unhandled)
    }
}

/// Routes inbound events to handlers
pub struct EventDispatcher {
    store: Arc<dyn WebhookEventStore>,
    dead_letters: DeadLetterStore,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    handlers: HashMap<EventCategory, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        dead_letters: DeadLetterStore,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dead_letters,
            clock,
            retry,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a category, replacing any previous one
    pub fn with_handler(mut self, category: EventCategory, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(category, handler);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run the routed handler without recording anything. `Ok(false)` means no
    /// handler exists for the event type.
    pub async fn run_handlers(&self, event: &InboundEvent) -> BillingResult<bool> {
        let handler = EventCategory::for_event_type(&event.event_type)
            .and_then(|category| self.handlers.get(&category));

        match handler {
            Some(handler) => {
                handler.handle(event).await?;
                Ok(true)
            }
            None => {
                tracing::info!(
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    "No handler for event type, treating as processed"
                );
                Ok(false)
            }
        }
    }

    /// Dispatch one event and record the outcome
    ///
    /// `event.retry_count` must be the count the caller observed when it took
    /// ownership; the failure write is conditional on it.
    pub async fn dispatch(&self, event: &InboundEvent) -> BillingResult<DispatchOutcome> {
        match self.run_handlers(event).await {
            Ok(handled) => {
                self.store.mark_processed(event.id, self.clock.now()).await?;
                tracing::info!(
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    "Webhook event processed"
                );
                Ok(if handled {
                    DispatchOutcome::Processed
                } else {
                    DispatchOutcome::Unhandled
                })
            }
            Err(e) => self.record_failure(event, &e).await,
        }
    }

    async fn record_failure(
        &self,
        event: &InboundEvent,
        error: &BillingError,
    ) -> BillingResult<DispatchOutcome> {
        let message = error.to_string();

        if self.retry.is_exhausted(event.retry_count + 1) {
            return match self.dead_letters.record_exhaustion(event, &message).await? {
                Some(snapshot) => Ok(DispatchOutcome::DeadLettered {
                    retry_count: snapshot.retry_count,
                }),
                None => {
                    tracing::warn!(
                        event_id = %event.provider_event_id,
                        expected_retry_count = event.retry_count,
                        "Event changed underneath this worker, exhaustion not recorded"
                    );
                    Ok(DispatchOutcome::Superseded)
                }
            };
        }

        let now = self.clock.now();
        let delay = self.retry.backoff_for(event.retry_count);
        let next_retry_at = now + delay;

        let Some(updated) = self
            .store
            .record_failure(event.id, event.retry_count, &message, Some(next_retry_at))
            .await?
        else {
            tracing::warn!(
                event_id = %event.provider_event_id,
                expected_retry_count = event.retry_count,
                "Event changed underneath this worker, failure not recorded"
            );
            return Ok(DispatchOutcome::Superseded);
        };

        tracing::warn!(
            event_id = %event.provider_event_id,
            event_type = %event.event_type,
            retry_count = updated.retry_count,
            backoff_secs = delay.as_secs(),
            error = %message,
            "Webhook event failed, scheduled for retry"
        );

        Ok(DispatchOutcome::Rescheduled {
            retry_count: updated.retry_count,
            next_retry_at,
        })
    }
}
