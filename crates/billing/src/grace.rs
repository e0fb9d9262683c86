//! Grace periods for soft-capped overages
//!
//! At most one window per (tenant, metric) is active: the most recently started
//! one, while it has not expired or been ended. Starting a new window supersedes
//! the previous one without deleting it.

use std::sync::Arc;
use std::time::Duration;
use tollbooth_shared::{Clock, TenantId, UsageMetric};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::GracePeriod;
use crate::store::GracePeriodStore;

#[derive(Clone)]
pub struct GracePeriodManager {
    store: Arc<dyn GracePeriodStore>,
    clock: Arc<dyn Clock>,
    duration: Duration,
}

impl GracePeriodManager {
    pub fn new(
        store: Arc<dyn GracePeriodStore>,
        clock: Arc<dyn Clock>,
        duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Open a new window starting now
    pub async fn start(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        usage_at_start: i64,
        quota_at_start: i64,
    ) -> BillingResult<GracePeriod> {
        let now = self.clock.now();

        // End the previous window so the new one is the only live row
        if let Some(previous) = self.store.latest_grace_period(tenant_id, metric).await? {
            if previous.is_active(now) {
                self.store.end_grace_period(previous.id, now).await?;
            }
        }

        let grace = GracePeriod {
            id: Uuid::new_v4(),
            tenant_id,
            metric,
            started_at: now,
            expires_at: now + self.duration,
            quota_at_start,
            usage_at_start,
            notified: false,
            ended_at: None,
        };
        self.store.insert_grace_period(&grace).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            metric = %metric,
            usage = usage_at_start,
            quota = quota_at_start,
            expires_at = %grace.expires_at,
            "Grace period started"
        );

        Ok(grace)
    }

    /// The active window, if any
    pub async fn get_active(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<GracePeriod>> {
        let now = self.clock.now();
        Ok(self
            .store
            .latest_grace_period(tenant_id, metric)
            .await?
            .filter(|grace| grace.is_active(now)))
    }

    /// Most recent window, active or not
    pub async fn get_latest(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<GracePeriod>> {
        self.store.latest_grace_period(tenant_id, metric).await
    }

    pub async fn is_in_grace_period(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<bool> {
        Ok(self.get_active(tenant_id, metric).await?.is_some())
    }

    /// End the active window early. No-op without one.
    pub async fn end(&self, tenant_id: TenantId, metric: UsageMetric) -> BillingResult<()> {
        if let Some(active) = self.get_active(tenant_id, metric).await? {
            self.store.end_grace_period(active.id, self.clock.now()).await?;
            tracing::info!(tenant_id = %tenant_id, metric = %metric, "Grace period ended");
        }
        Ok(())
    }

    /// Record that the tenant was told about the active window
    pub async fn mark_notified(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<bool> {
        match self.get_active(tenant_id, metric).await? {
            Some(active) if !active.notified => {
                self.store.mark_grace_notified(active.id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use time::macros::datetime;
    use tollbooth_shared::ManualClock;

    fn manager(store: &InMemoryStore, clock: Arc<ManualClock>) -> GracePeriodManager {
        GracePeriodManager::new(Arc::new(store.clone()), clock, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_window_expires_after_duration() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let grace = manager(&store, clock.clone());
        let tenant = TenantId::new();

        grace.start(tenant, UsageMetric::ApiCalls, 1000, 1000).await.unwrap();
        assert!(grace.is_in_grace_period(tenant, UsageMetric::ApiCalls).await.unwrap());
        assert!(!grace.is_in_grace_period(tenant, UsageMetric::Tokens).await.unwrap());

        clock.advance(time::Duration::hours(1));
        assert!(grace.get_active(tenant, UsageMetric::ApiCalls).await.unwrap().is_none());
        assert!(grace.get_latest(tenant, UsageMetric::ApiCalls).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restart_supersedes_previous_window() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let grace = manager(&store, clock.clone());
        let tenant = TenantId::new();

        let first = grace.start(tenant, UsageMetric::ApiCalls, 1000, 1000).await.unwrap();
        clock.advance(time::Duration::minutes(10));
        let second = grace.start(tenant, UsageMetric::ApiCalls, 1100, 1000).await.unwrap();

        let active = grace.get_active(tenant, UsageMetric::ApiCalls).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(active.id, first.id);
        assert_eq!(active.usage_at_start, 1100);
    }

    #[tokio::test]
    async fn test_end_and_notify() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let grace = manager(&store, clock);
        let tenant = TenantId::new();

        assert!(!grace.mark_notified(tenant, UsageMetric::Seats).await.unwrap());
        grace.start(tenant, UsageMetric::Seats, 11, 10).await.unwrap();
        assert!(grace.mark_notified(tenant, UsageMetric::Seats).await.unwrap());
        assert!(!grace.mark_notified(tenant, UsageMetric::Seats).await.unwrap());

        grace.end(tenant, UsageMetric::Seats).await.unwrap();
        assert!(!grace.is_in_grace_period(tenant, UsageMetric::Seats).await.unwrap());
    }
}
