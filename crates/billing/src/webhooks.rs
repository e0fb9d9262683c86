//! Stripe webhook ingestion
//!
//! Verifies the `Stripe-Signature` header, stores each distinct provider event
//! exactly once and acknowledges before any handler runs. Freshly stored events
//! are handed to the dispatch worker over an in-process channel; anything the
//! worker never gets to is picked up by the retry scheduler once its claim
//! lease runs out.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tollbooth_shared::Clock;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{BillingError, BillingResult};
use crate::models::InboundEvent;
use crate::store::WebhookEventStore;

type HmacSha256 = Hmac<Sha256>;

/// Sender half of the dispatch handoff
pub type DispatchSender = mpsc::UnboundedSender<InboundEvent>;
/// Receiver half of the dispatch handoff
pub type DispatchReceiver = mpsc::UnboundedReceiver<InboundEvent>;

/// Acknowledgment returned to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestAck {
    /// Provider event id
    pub event_id: String,
    /// Stored inbound row
    pub inbound_id: Uuid,
    /// The event had already been ingested; nothing was dispatched
    pub duplicate: bool,
}

/// The fields ingestion needs from the provider envelope
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `t=timestamp,v1=signature[,v1=...][,v0=...]`
    fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            BillingError::SignatureVerification("missing timestamp in signature header".into())
        })?;
        if signatures.is_empty() {
            return Err(BillingError::SignatureVerification(
                "missing v1 signature in signature header".into(),
            ));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Compute the hex `v1` signature for a payload
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a full `Stripe-Signature` header value for a payload
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}

/// Webhook ingress: verify, deduplicate, persist, acknowledge
#[derive(Clone)]
pub struct WebhookIngress {
    store: Arc<dyn WebhookEventStore>,
    clock: Arc<dyn Clock>,
    webhook_secret: String,
    tolerance: Duration,
    ingest_timeout: Duration,
    claim_lease: Duration,
    handoff: Option<DispatchSender>,
}

impl WebhookIngress {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        clock: Arc<dyn Clock>,
        webhook_secret: impl Into<String>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            webhook_secret: webhook_secret.into(),
            tolerance: config.webhook_tolerance,
            ingest_timeout: config.ingest_timeout,
            claim_lease: config.claim_lease,
            handoff: None,
        }
    }

    /// Hand freshly stored events to a dispatch worker
    pub fn with_handoff(mut self, sender: DispatchSender) -> Self {
        self.handoff = Some(sender);
        self
    }

    /// Verify a Stripe signature header against the payload
    ///
    /// Uses manual verification so newer Stripe API versions that async-stripe
    /// cannot deserialize are still accepted.
    pub fn verify_signature(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let header = SignatureHeader::parse(signature)?;

        let now = self.clock.now().unix_timestamp();
        let skew = (now - header.timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                skew_secs = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureVerification(
                "timestamp outside tolerance".into(),
            ));
        }

        let signed_payload = format!("{}.{}", header.timestamp, payload);
        for candidate in &header.signatures {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
                .map_err(|_| BillingError::Config("invalid webhook secret".into()))?;
            mac.update(signed_payload.as_bytes());
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }

        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::SignatureVerification("signature mismatch".into()))
    }

    /// Verify, deduplicate and store one delivery
    ///
    /// Returns before any handler runs. Bounded by the configured ingest timeout.
    pub async fn ingest(&self, payload: &str, signature: &str) -> BillingResult<IngestAck> {
        tokio::time::timeout(self.ingest_timeout, self.ingest_inner(payload, signature)).await?
    }

    async fn ingest_inner(&self, payload: &str, signature: &str) -> BillingResult<IngestAck> {
        self.verify_signature(payload, signature)?;

        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("malformed event payload: {}", e)))?;
        let envelope: EventEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| BillingError::InvalidInput(format!("malformed event envelope: {}", e)))?;

        let now = self.clock.now();
        let mut event = InboundEvent::received(&envelope.id, &envelope.event_type, value, now);
        // The dispatch worker owns the event until the lease runs out
        if self.handoff.is_some() {
            event.claimed_until = Some(now + self.claim_lease);
        }

        if !self.store.insert_if_absent(&event).await? {
            let inbound_id = self
                .store
                .get_by_provider_id(&envelope.id)
                .await?
                .map(|existing| existing.id)
                .unwrap_or(event.id);
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Duplicate webhook delivery acknowledged"
            );
            return Ok(IngestAck {
                event_id: envelope.id,
                inbound_id,
                duplicate: true,
            });
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            inbound_id = %event.id,
            "Webhook event stored"
        );

        let inbound_id = event.id;
        if let Some(sender) = &self.handoff {
            if sender.send(event).is_err() {
                tracing::warn!(
                    event_id = %envelope.id,
                    "Dispatch worker unavailable; event left for the retry scheduler"
                );
            }
        }

        Ok(IngestAck {
            event_id: envelope.id,
            inbound_id,
            duplicate: false,
        })
    }
}

/// Drain freshly ingested events into the dispatcher until every sender is dropped
pub fn spawn_dispatch_worker(
    dispatcher: Arc<EventDispatcher>,
    mut receiver: DispatchReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = dispatcher.dispatch(&event).await {
                tracing::error!(
                    event_id = %event.provider_event_id,
                    error = %e,
                    "Dispatch failed to record its outcome"
                );
            }
        }
        tracing::info!("Dispatch worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeadLetterEvent;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use tollbooth_shared::ManualClock;

    /// Store whose inserts hang far past any ingest timeout
    struct StalledStore {
        inner: InMemoryStore,
        stall: Duration,
    }

    #[async_trait]
    impl WebhookEventStore for StalledStore {
        async fn insert_if_absent(&self, event: &InboundEvent) -> BillingResult<bool> {
            tokio::time::sleep(self.stall).await;
            self.inner.insert_if_absent(event).await
        }
        async fn get_event(&self, id: Uuid) -> BillingResult<Option<InboundEvent>> {
            self.inner.get_event(id).await
        }
        async fn get_by_provider_id(&self, id: &str) -> BillingResult<Option<InboundEvent>> {
            self.inner.get_by_provider_id(id).await
        }
        async fn select_due(
            &self,
            now: OffsetDateTime,
            max_retries: i32,
            limit: i64,
        ) -> BillingResult<Vec<InboundEvent>> {
            self.inner.select_due(now, max_retries, limit).await
        }
        async fn try_claim(
            &self,
            id: Uuid,
            expected_retry_count: i32,
            now: OffsetDateTime,
            lease_until: OffsetDateTime,
        ) -> BillingResult<bool> {
            self.inner.try_claim(id, expected_retry_count, now, lease_until).await
        }
        async fn mark_processed(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
            self.inner.mark_processed(id, at).await
        }
        async fn record_failure(
            &self,
            id: Uuid,
            expected_retry_count: i32,
            error_message: &str,
            next_retry_at: Option<OffsetDateTime>,
        ) -> BillingResult<Option<InboundEvent>> {
            self.inner
                .record_failure(id, expected_retry_count, error_message, next_retry_at)
                .await
        }
        async fn record_exhaustion(
            &self,
            id: Uuid,
            expected_retry_count: i32,
            error_message: &str,
            moved_at: OffsetDateTime,
        ) -> BillingResult<Option<DeadLetterEvent>> {
            self.inner
                .record_exhaustion(id, expected_retry_count, error_message, moved_at)
                .await
        }
        async fn select_exhausted(
            &self,
            max_retries: i32,
            limit: i64,
        ) -> BillingResult<Vec<InboundEvent>> {
            self.inner.select_exhausted(max_retries, limit).await
        }
        async fn promote_to_dead_letter(&self, snapshot: &DeadLetterEvent) -> BillingResult<bool> {
            self.inner.promote_to_dead_letter(snapshot).await
        }
        async fn get_dead_letter(&self, id: Uuid) -> BillingResult<Option<DeadLetterEvent>> {
            self.inner.get_dead_letter(id).await
        }
        async fn list_dead_letters(
            &self,
            limit: i64,
            offset: i64,
        ) -> BillingResult<Vec<DeadLetterEvent>> {
            self.inner.list_dead_letters(limit, offset).await
        }
        async fn delete_dead_letter(&self, id: Uuid) -> BillingResult<bool> {
            self.inner.delete_dead_letter(id).await
        }
    }

    const SECRET: &str = "whsec_test_secret";

    fn payload(id: &str) -> String {
        serde_json::json!({
            "id": id,
            "type": "invoice.paid",
            "created": 1714564800,
            "data": { "object": { "id": "in_123" } }
        })
        .to_string()
    }

    fn ingress(store: &InMemoryStore, clock: Arc<ManualClock>) -> WebhookIngress {
        WebhookIngress::new(
            Arc::new(store.clone()),
            clock,
            SECRET,
            &PipelineConfig::default(),
        )
    }

    #[test]
    fn test_parse_signature_header() {
        let header = SignatureHeader::parse("t=1714564800,v1=abc,v0=def,v1=123").unwrap();
        assert_eq!(header.timestamp, 1714564800);
        assert_eq!(header.signatures, vec!["abc".to_string(), "123".to_string()]);

        assert!(SignatureHeader::parse("v1=abc").is_err());
        assert!(SignatureHeader::parse("t=1714564800").is_err());
    }

    #[tokio::test]
    async fn test_ingest_valid_signature() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let ingress = ingress(&store, clock.clone());

        let body = payload("evt_1");
        let header = signature_header(SECRET, clock.now().unix_timestamp(), &body).unwrap();
        let ack = ingress.ingest(&body, &header).await.unwrap();

        assert_eq!(ack.event_id, "evt_1");
        assert!(!ack.duplicate);
        let stored = store.get_by_provider_id("evt_1").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.event_type, "invoice.paid");
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_signature_without_persisting() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let ingress = ingress(&store, clock.clone());

        let body = payload("evt_1");
        let header = signature_header("whsec_other", clock.now().unix_timestamp(), &body).unwrap();
        let err = ingress.ingest(&body, &header).await.unwrap_err();

        assert!(matches!(err, BillingError::SignatureVerification(_)));
        assert_eq!(store.inbound_count().await, 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_stale_timestamp() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let ingress = ingress(&store, clock.clone());

        let body = payload("evt_1");
        let stale = clock.now().unix_timestamp() - 301;
        let header = signature_header(SECRET, stale, &body).unwrap();

        assert!(matches!(
            ingress.ingest(&body, &header).await,
            Err(BillingError::SignatureVerification(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_acknowledged_once() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingress = ingress(&store, clock.clone()).with_handoff(tx);

        let body = payload("evt_1");
        let header = signature_header(SECRET, clock.now().unix_timestamp(), &body).unwrap();
        let first = ingress.ingest(&body, &header).await.unwrap();
        let second = ingress.ingest(&body, &header).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.inbound_id, second.inbound_id);
        assert_eq!(store.inbound_count().await, 1);

        // Only the first delivery reaches the dispatcher
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_store_hits_ingest_timeout() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let config = PipelineConfig {
            ingest_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let stalled = StalledStore {
            inner: store.clone(),
            stall: Duration::from_secs(30),
        };
        let ingress = WebhookIngress::new(Arc::new(stalled), clock.clone(), SECRET, &config);

        let body = payload("evt_slow");
        let header = signature_header(SECRET, clock.now().unix_timestamp(), &body).unwrap();
        let started = std::time::Instant::now();
        let err = ingress.ingest(&body, &header).await.unwrap_err();

        assert!(matches!(err, BillingError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.inbound_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid_input() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let ingress = ingress(&store, clock.clone());

        let body = r#"{"object":"event"}"#;
        let header = signature_header(SECRET, clock.now().unix_timestamp(), body).unwrap();

        assert!(matches!(
            ingress.ingest(body, &header).await,
            Err(BillingError::InvalidInput(_))
        ));
    }
}
