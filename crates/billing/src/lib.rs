#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tollbooth billing pipeline
//!
//! Stripe webhook ingestion with retries and a dead-letter store, plus usage
//! metering: emission, aggregation, quota enforcement and submission to Stripe.

pub mod cache;
pub mod client;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod grace;
pub mod handlers;
pub mod metered;
pub mod models;
pub mod quota;
pub mod retry;
pub mod store;
pub mod usage;
pub mod webhooks;

pub use cache::{
    CacheBackend, FallbackCache, InMemoryCacheBackend, RedisCacheBackend, UsageCache, UsageSnapshot,
    UsageSummary,
};
pub use client::{StripeClient, StripeConfig};
pub use config::{PipelineConfig, RetryPolicy};
pub use dead_letter::{DeadLetterStore, ReplayResult};
pub use dispatcher::{DispatchOutcome, EventCategory, EventDispatcher, EventHandler};
pub use error::{BillingError, BillingResult, QuotaRejection};
pub use events::{BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use grace::GracePeriodManager;
pub use handlers::{AuditTrailHandler, SubscriptionHandler};
pub use metered::{SinkSummary, StripeUsageReporter, SubmissionResult, UsageReporter, UsageSink};
pub use models::*;
pub use quota::{QuotaDecision, QuotaEnforcer};
pub use retry::{RetryBatchSummary, RetryScheduler};
pub use store::{
    BillingEventStore, GracePeriodStore, InMemoryStore, PgStore, UsageStore, WebhookEventStore,
};
pub use usage::{AggregationSummary, UsageAggregator, UsageEventEmitter, UsageRecorder};
pub use webhooks::{IngestAck, WebhookIngress};

use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tollbooth_shared::{Clock, SystemClock};

use webhooks::DispatchReceiver;

/// Storage behind every pipeline component
#[derive(Clone)]
pub struct PipelineStores {
    pub webhooks: Arc<dyn WebhookEventStore>,
    pub usage: Arc<dyn UsageStore>,
    pub grace: Arc<dyn GracePeriodStore>,
    pub billing_events: Arc<dyn BillingEventStore>,
}

impl PipelineStores {
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            webhooks: store.clone(),
            usage: store.clone(),
            grace: store.clone(),
            billing_events: store,
        }
    }

    pub fn in_memory(store: &InMemoryStore) -> Self {
        let store = Arc::new(store.clone());
        Self {
            webhooks: store.clone(),
            usage: store.clone(),
            grace: store.clone(),
            billing_events: store,
        }
    }
}

/// Builder for [`BillingPipeline`]
pub struct BillingPipelineBuilder {
    stores: PipelineStores,
    reporter: Arc<dyn UsageReporter>,
    webhook_secret: String,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    cache_backend: Option<Arc<dyn CacheBackend>>,
}

impl BillingPipelineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// External cache in front of the in-process fallback
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn build(self) -> BillingResult<BillingPipeline> {
        self.config.validate()?;
        let Self {
            stores,
            reporter,
            webhook_secret,
            clock,
            config,
            cache_backend,
        } = self;

        let cache = UsageCache::new(
            Arc::new(FallbackCache::new(cache_backend, clock.clone())),
            stores.usage.clone(),
            clock.clone(),
            config.cache_ttl,
        );
        let grace =
            GracePeriodManager::new(stores.grace.clone(), clock.clone(), config.grace_period);
        let quota = QuotaEnforcer::new(cache.clone(), grace.clone(), config.warning_percent);
        let events = BillingEventLogger::new(stores.billing_events.clone(), clock.clone());

        let audit = AuditTrailHandler::new(events.clone());
        let dead_letters = DeadLetterStore::new(stores.webhooks.clone(), clock.clone());
        let dispatcher = EventDispatcher::new(
            stores.webhooks.clone(),
            dead_letters.clone(),
            clock.clone(),
            config.retry,
        )
        .with_handler(EventCategory::Invoice, Arc::new(audit.clone()))
        .with_handler(EventCategory::Payment, Arc::new(audit.clone()))
        .with_handler(EventCategory::Charge, Arc::new(audit.clone()))
        .with_handler(
            EventCategory::Subscription,
            Arc::new(SubscriptionHandler::new(
                audit,
                cache.clone(),
                stores.usage.clone(),
            )),
        );
        let dispatcher = Arc::new(dispatcher);

        let (sender, receiver) = mpsc::unbounded_channel();
        let ingress =
            WebhookIngress::new(stores.webhooks.clone(), clock.clone(), webhook_secret, &config)
                .with_handoff(sender);
        let retry = RetryScheduler::new(
            stores.webhooks.clone(),
            dispatcher.clone(),
            dead_letters.clone(),
            clock.clone(),
            &config,
        );

        let emitter = UsageEventEmitter::for_store(stores.usage.clone(), clock.clone());
        let aggregator = UsageAggregator::new(stores.usage.clone(), clock.clone(), &config)
            .with_cache(cache.clone());
        let sink = UsageSink::new(stores.usage.clone(), reporter, clock, &config);

        Ok(BillingPipeline {
            ingress,
            dispatcher,
            retry: Arc::new(retry),
            dead_letters,
            cache,
            grace,
            quota,
            emitter,
            aggregator: Arc::new(aggregator),
            sink: Arc::new(sink),
            events,
            config,
            dispatch_receiver: Mutex::new(Some(receiver)),
        })
    }
}

/// Every pipeline component wired to shared stores, clock and config
pub struct BillingPipeline {
    pub ingress: WebhookIngress,
    pub dispatcher: Arc<EventDispatcher>,
    pub retry: Arc<RetryScheduler>,
    pub dead_letters: DeadLetterStore,
    pub cache: UsageCache,
    pub grace: GracePeriodManager,
    pub quota: QuotaEnforcer,
    pub emitter: UsageEventEmitter,
    pub aggregator: Arc<UsageAggregator>,
    pub sink: Arc<UsageSink>,
    pub events: BillingEventLogger,
    pub config: PipelineConfig,
    dispatch_receiver: Mutex<Option<DispatchReceiver>>,
}

impl BillingPipeline {
    pub fn builder(
        stores: PipelineStores,
        reporter: Arc<dyn UsageReporter>,
        webhook_secret: impl Into<String>,
    ) -> BillingPipelineBuilder {
        BillingPipelineBuilder {
            stores,
            reporter,
            webhook_secret: webhook_secret.into(),
            clock: Arc::new(SystemClock),
            config: PipelineConfig::default(),
            cache_backend: None,
        }
    }

    /// Start draining freshly ingested events into the dispatcher. Only the
    /// first call starts a worker; later calls return `None`.
    pub fn spawn_dispatch_worker(&self) -> Option<JoinHandle<()>> {
        let receiver = self.dispatch_receiver.lock().ok()?.take()?;
        Some(webhooks::spawn_dispatch_worker(self.dispatcher.clone(), receiver))
    }
}
