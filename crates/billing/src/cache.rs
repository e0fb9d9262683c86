//! Usage and quota cache
//!
//! Cache-aside reads of per-tenant usage totals and quotas. Values live in Redis
//! when it is reachable and in a process-local map otherwise; both honour the
//! same TTL so callers see the same staleness bound either way.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tollbooth_shared::{BillingPeriod, Clock, TenantId, UsageMetric};

use crate::error::{BillingError, BillingResult};
use crate::models::UsageQuota;
use crate::store::UsageStore;

/// Default bound on a single Redis round trip
const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_millis(250);

/// Entry count at which a write first sweeps expired entries from the local map
const DEFAULT_SWEEP_THRESHOLD: usize = 4096;

/// Byte-level cache backend with per-entry TTL
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// `Ok(None)` for a missing or expired key
    async fn get_bytes(&self, key: &str) -> BillingResult<Option<Vec<u8>>>;

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()>;

    async fn delete(&self, key: &str) -> BillingResult<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Serving from a fallback because the configured backend is failing
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Cache entry with expiration
#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: OffsetDateTime,
}

/// Thread-safe in-process cache
///
/// Expired entries are dropped by writes once the map reaches the sweep
/// threshold. After a sweep the threshold moves to twice the surviving entry
/// count, so a map of live entries is not rescanned on every insert.
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    base_threshold: usize,
    next_sweep_at: AtomicUsize,
}

impl InMemoryCacheBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sweep_threshold(clock, DEFAULT_SWEEP_THRESHOLD)
    }

    pub fn with_sweep_threshold(clock: Arc<dyn Clock>, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            base_threshold: threshold,
            next_sweep_at: AtomicUsize::new(threshold),
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        match self.entries.write() {
            Ok(mut entries) => self.sweep(&mut entries, now),
            Err(_) => 0,
        }
    }

    fn sweep(&self, entries: &mut HashMap<String, CacheEntry>, now: OffsetDateTime) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        self.next_sweep_at.store(
            (entries.len() * 2).max(self.base_threshold),
            Ordering::Relaxed,
        );
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "Swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get_bytes(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        let entries = self
            .entries
            .read()
            .map_err(|_| BillingError::CacheUnavailable("in-memory cache lock poisoned".into()))?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()> {
        let now = self.clock.now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BillingError::CacheUnavailable("in-memory cache lock poisoned".into()))?;
        if entries.len() >= self.next_sweep_at.load(Ordering::Relaxed) {
            self.sweep(&mut entries, now);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> BillingResult<()> {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis cache backend over a reconnecting connection manager
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCacheBackend {
    /// Connect to Redis
    pub async fn connect(url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(DEFAULT_REDIS_TIMEOUT * 8, ConnectionManager::new(client))
            .await
            .map_err(|_| BillingError::CacheUnavailable("timed out connecting to Redis".into()))??;
        Ok(Self {
            conn,
            op_timeout: DEFAULT_REDIS_TIMEOUT,
        })
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn bounded<T, F>(&self, op: F) -> BillingResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BillingError::CacheUnavailable("Redis operation timed out".into())),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get_bytes(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let value: Option<Vec<u8>> = conn.get(key).await?;
            Ok::<_, redis::RedisError>(value)
        })
        .await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        self.bounded(async move {
            let _: () = conn.set_ex(key, value, ttl_secs).await?;
            Ok::<_, redis::RedisError>(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let _: () = conn.del(key).await?;
            Ok::<_, redis::RedisError>(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Primary backend with transparent fallback to an in-process map
///
/// Never returns an error: primary failures are logged and served by the local map.
pub struct FallbackCache {
    primary: Option<Arc<dyn CacheBackend>>,
    local: InMemoryCacheBackend,
    degraded: AtomicBool,
}

impl FallbackCache {
    pub fn new(primary: Option<Arc<dyn CacheBackend>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            primary,
            local: InMemoryCacheBackend::new(clock),
            degraded: AtomicBool::new(false),
        }
    }

    /// Process-local only
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(None, clock)
    }

    fn primary_failed(&self, backend: &str, op: &str, err: &BillingError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                backend = backend,
                op = op,
                error = %err,
                "Cache backend unavailable, falling back to in-memory cache"
            );
        }
    }

    fn primary_ok(&self, backend: &str) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!(backend = backend, "Cache backend recovered");
        }
    }
}

#[async_trait]
impl CacheBackend for FallbackCache {
    async fn get_bytes(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        if let Some(primary) = &self.primary {
            match primary.get_bytes(key).await {
                Ok(value) => {
                    self.primary_ok(primary.name());
                    return Ok(value);
                }
                Err(e) => self.primary_failed(primary.name(), "get", &e),
            }
        }
        self.local.get_bytes(key).await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()> {
        if let Some(primary) = &self.primary {
            match primary.set_bytes(key, value.clone(), ttl).await {
                Ok(()) => {
                    self.primary_ok(primary.name());
                    return Ok(());
                }
                Err(e) => self.primary_failed(primary.name(), "set", &e),
            }
        }
        self.local.set_bytes(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> BillingResult<()> {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.delete(key).await {
                self.primary_failed(primary.name(), "delete", &e);
            }
        }
        // Entries written while degraded must not outlive an invalidation
        self.local.delete(key).await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }

    /// The last primary operation failed
    fn is_degraded(&self) -> bool {
        self.primary.is_some() && self.degraded.load(Ordering::Relaxed)
    }
}

/// Quota lookup result, including "no quota"
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedQuota {
    quota: Option<UsageQuota>,
}

/// Usage total cached together with the period it covers
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedUsage {
    #[serde(with = "time::serde::rfc3339")]
    period_start: OffsetDateTime,
    amount: i64,
}

/// Usage against quota for one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub metric: UsageMetric,
    pub usage: i64,
    /// `None` means unlimited
    pub quota: Option<i64>,
    pub hard_cap: bool,
    pub percentage: f64,
    /// `None` means unlimited
    pub remaining: Option<i64>,
    pub over_quota: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

impl UsageSnapshot {
    fn new(
        metric: UsageMetric,
        usage: i64,
        quota: Option<&UsageQuota>,
        period: BillingPeriod,
    ) -> Self {
        let limit = quota.map(|q| q.quota_amount);
        Self {
            metric,
            usage,
            quota: limit,
            hard_cap: quota.is_some_and(|q| q.hard_cap),
            percentage: usage_percentage(usage, limit),
            remaining: limit.map(|l| (l - usage).max(0)),
            over_quota: limit.is_some_and(|l| usage >= l),
            period_start: period.start,
            period_end: period.end,
        }
    }
}

/// Current-period usage across every tracked metric
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub tenant_id: TenantId,
    pub metrics: Vec<UsageSnapshot>,
    pub total_usage: i64,
    pub metrics_over_quota: usize,
    /// Highest percentage across metrics with a quota
    pub max_percentage: f64,
}

/// `usage / quota * 100`; zero for unlimited, 100 for a zero quota with any usage
pub fn usage_percentage(usage: i64, quota: Option<i64>) -> f64 {
    match quota {
        None => 0.0,
        Some(q) if q <= 0 => {
            if usage > 0 {
                100.0
            } else {
                0.0
            }
        }
        Some(q) => usage as f64 / q as f64 * 100.0,
    }
}

/// Read-through cache of usage totals and quotas
#[derive(Clone)]
pub struct UsageCache {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl UsageCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            clock,
            ttl,
        }
    }

    fn usage_key(tenant_id: TenantId, metric: UsageMetric) -> String {
        format!("tollbooth:usage:{}:{}", tenant_id, metric)
    }

    fn quota_key(tenant_id: TenantId, metric: UsageMetric) -> String {
        format!("tollbooth:quota:{}:{}", tenant_id, metric)
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get_bytes(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key = key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Cache read failed, reading through");
                None
            }
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.backend.set_bytes(key, bytes, self.ttl).await {
            tracing::warn!(key = key, error = %e, "Cache write failed");
        }
    }

    /// Quota for the current period, `None` when the tenant has no quota (unlimited)
    pub async fn get_quota(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<UsageQuota>> {
        let key = Self::quota_key(tenant_id, metric);
        let now = self.clock.now();

        if let Some(cached) = self.cached::<CachedQuota>(&key).await {
            // A cached quota whose period has rolled over is a miss
            if cached.quota.as_ref().map_or(true, |q| q.period().contains(now)) {
                return Ok(cached.quota);
            }
        }

        let quota = self.store.current_quota(tenant_id, metric, now).await?;
        self.populate(&key, &CachedQuota { quota: quota.clone() }).await;
        Ok(quota)
    }

    /// Period the usage total is measured over: the quota's, or the calendar month
    async fn period_for(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<BillingPeriod> {
        Ok(match self.get_quota(tenant_id, metric).await? {
            Some(quota) => quota.period(),
            None => BillingPeriod::containing(self.clock.now()),
        })
    }

    async fn usage_in(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        period: BillingPeriod,
    ) -> BillingResult<i64> {
        let key = Self::usage_key(tenant_id, metric);
        if let Some(cached) = self.cached::<CachedUsage>(&key).await {
            if cached.period_start == period.start {
                return Ok(cached.amount);
            }
        }

        let amount = self.store.period_usage(tenant_id, metric, period).await?;
        self.populate(
            &key,
            &CachedUsage {
                period_start: period.start,
                amount,
            },
        )
        .await;
        Ok(amount)
    }

    /// Aggregated usage for the current period
    pub async fn get_usage(&self, tenant_id: TenantId, metric: UsageMetric) -> BillingResult<i64> {
        let period = self.period_for(tenant_id, metric).await?;
        self.usage_in(tenant_id, metric, period).await
    }

    /// `usage >= quota`; never over when there is no quota
    pub async fn is_over_quota(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<bool> {
        Ok(self.snapshot(tenant_id, metric).await?.over_quota)
    }

    pub async fn get_usage_percentage(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<f64> {
        Ok(self.snapshot(tenant_id, metric).await?.percentage)
    }

    /// Units left before the quota, `None` when unlimited
    pub async fn get_remaining(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<i64>> {
        Ok(self.snapshot(tenant_id, metric).await?.remaining)
    }

    /// Usage, quota and derived figures read in one pass
    pub async fn snapshot(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<UsageSnapshot> {
        let quota = self.get_quota(tenant_id, metric).await?;
        let period = quota
            .as_ref()
            .map(UsageQuota::period)
            .unwrap_or_else(|| BillingPeriod::containing(self.clock.now()));
        let usage = self.usage_in(tenant_id, metric, period).await?;
        Ok(UsageSnapshot::new(metric, usage, quota.as_ref(), period))
    }

    /// Every metric for the tenant's current period
    pub async fn summary(&self, tenant_id: TenantId) -> BillingResult<UsageSummary> {
        let mut metrics = Vec::with_capacity(UsageMetric::ALL.len());
        for metric in UsageMetric::ALL {
            metrics.push(self.snapshot(tenant_id, metric).await?);
        }

        Ok(UsageSummary {
            tenant_id,
            total_usage: metrics.iter().map(|m| m.usage).sum(),
            metrics_over_quota: metrics.iter().filter(|m| m.over_quota).count(),
            max_percentage: metrics
                .iter()
                .filter(|m| m.quota.is_some())
                .map(|m| m.percentage)
                .fold(0.0, f64::max),
            metrics,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.backend.is_degraded()
    }

    /// Drop cached usage and quota for one metric
    pub async fn invalidate(&self, tenant_id: TenantId, metric: UsageMetric) {
        for key in [Self::usage_key(tenant_id, metric), Self::quota_key(tenant_id, metric)] {
            if let Err(e) = self.backend.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "Cache invalidation failed");
            }
        }
    }

    /// Drop cached usage and quota for every metric of a tenant
    pub async fn invalidate_tenant(&self, tenant_id: TenantId) {
        for metric in UsageMetric::ALL {
            self.invalidate(tenant_id, metric).await;
        }
        tracing::debug!(tenant_id = %tenant_id, "Usage cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::usage::tests::seed_usage;
    use time::macros::datetime;
    use tollbooth_shared::ManualClock;

    /// Backend that fails every call
    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get_bytes(&self, _key: &str) -> BillingResult<Option<Vec<u8>>> {
            Err(BillingError::CacheUnavailable("connection refused".into()))
        }
        async fn set_bytes(&self, _: &str, _: Vec<u8>, _: Duration) -> BillingResult<()> {
            Err(BillingError::CacheUnavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> BillingResult<()> {
            Err(BillingError::CacheUnavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn cache_over(
        backend: Arc<dyn CacheBackend>,
        store: &InMemoryStore,
        clock: Arc<ManualClock>,
    ) -> UsageCache {
        UsageCache::new(backend, Arc::new(store.clone()), clock, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_write_sweeps_expired_entries() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let local = InMemoryCacheBackend::with_sweep_threshold(clock.clone(), 4);
        let ttl = Duration::from_secs(60);
        for i in 0..4 {
            local.set_bytes(&format!("usage:{}", i), vec![1], ttl).await.unwrap();
        }
        assert_eq!(local.len(), 4);

        clock.advance(time::Duration::seconds(61));
        local.set_bytes("usage:fresh", vec![2], ttl).await.unwrap();

        assert_eq!(local.len(), 1);
        assert_eq!(local.get_bytes("usage:fresh").await.unwrap(), Some(vec![2]));
        assert!(local.get_bytes("usage:0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_entries_raise_sweep_threshold() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let local = InMemoryCacheBackend::with_sweep_threshold(clock.clone(), 2);
        let ttl = Duration::from_secs(60);
        for key in ["a", "b", "c"] {
            local.set_bytes(key, vec![0], ttl).await.unwrap();
        }

        // Nothing had expired, so the next sweep waits for twice the live count
        assert_eq!(local.len(), 3);
        assert_eq!(local.next_sweep_at.load(Ordering::Relaxed), 4);

        clock.advance(time::Duration::seconds(61));
        assert_eq!(local.cleanup(), 3);
        assert!(local.is_empty());
        assert_eq!(local.next_sweep_at.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_fallback_writes_sweep_local_map() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let fallback = Arc::new(FallbackCache::new(Some(Arc::new(DownBackend)), clock.clone()));
        let ttl = Duration::from_secs(60);
        for i in 0..DEFAULT_SWEEP_THRESHOLD {
            fallback.set_bytes(&format!("quota:{}", i), vec![0], ttl).await.unwrap();
        }
        assert_eq!(fallback.local.len(), DEFAULT_SWEEP_THRESHOLD);

        // Redis stays down; the next read-through write lands locally and sweeps
        clock.advance(time::Duration::seconds(61));
        let cache = cache_over(fallback.clone(), &store, clock.clone());
        let tenant = TenantId::new();
        seed_usage(&store, tenant, UsageMetric::Tokens, 9, clock.now()).await;
        assert_eq!(cache.get_usage(tenant, UsageMetric::Tokens).await.unwrap(), 9);
        assert!(fallback.local.len() <= 2);
    }

    #[test]
    fn test_usage_percentage() {
        assert_eq!(usage_percentage(80, Some(100)), 80.0);
        assert_eq!(usage_percentage(80, None), 0.0);
        assert_eq!(usage_percentage(1, Some(0)), 100.0);
    }

    #[tokio::test]
    async fn test_quota_math() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let local = Arc::new(FallbackCache::in_memory(clock.clone()));
        let cache = cache_over(local, &store, clock.clone());
        let tenant = TenantId::new();
        let period = BillingPeriod::containing(now);
        store
            .upsert_quota(&UsageQuota::new(tenant, UsageMetric::ApiCalls, 100, false, period))
            .await
            .unwrap();
        seed_usage(&store, tenant, UsageMetric::ApiCalls, 80, now).await;

        let snapshot = cache.snapshot(tenant, UsageMetric::ApiCalls).await.unwrap();
        assert_eq!(snapshot.usage, 80);
        assert_eq!(snapshot.percentage, 80.0);
        assert_eq!(snapshot.remaining, Some(20));
        assert!(!snapshot.over_quota);

        seed_usage(&store, tenant, UsageMetric::ApiCalls, 20, now).await;
        cache.invalidate(tenant, UsageMetric::ApiCalls).await;
        assert!(cache.is_over_quota(tenant, UsageMetric::ApiCalls).await.unwrap());
        assert_eq!(cache.get_remaining(tenant, UsageMetric::ApiCalls).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_missing_quota_is_unlimited() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let cache = cache_over(Arc::new(FallbackCache::in_memory(clock.clone())), &store, clock);
        let tenant = TenantId::new();
        seed_usage(&store, tenant, UsageMetric::Tokens, 1_000_000, now).await;

        assert!(cache.get_quota(tenant, UsageMetric::Tokens).await.unwrap().is_none());
        assert!(!cache.is_over_quota(tenant, UsageMetric::Tokens).await.unwrap());
        assert_eq!(cache.get_remaining(tenant, UsageMetric::Tokens).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cached_usage_is_stale_until_ttl() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let local = Arc::new(FallbackCache::in_memory(clock.clone()));
        let cache = cache_over(local, &store, clock.clone());
        let tenant = TenantId::new();
        seed_usage(&store, tenant, UsageMetric::Seats, 3, now).await;

        assert_eq!(cache.get_usage(tenant, UsageMetric::Seats).await.unwrap(), 3);
        seed_usage(&store, tenant, UsageMetric::Seats, 2, now).await;
        assert_eq!(cache.get_usage(tenant, UsageMetric::Seats).await.unwrap(), 3);

        clock.advance(time::Duration::seconds(61));
        assert_eq!(cache.get_usage(tenant, UsageMetric::Seats).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_local_map() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let fallback = Arc::new(FallbackCache::new(Some(Arc::new(DownBackend)), clock.clone()));
        let cache = cache_over(fallback.clone(), &store, clock.clone());
        let tenant = TenantId::new();
        seed_usage(&store, tenant, UsageMetric::Storage, 7, now).await;

        assert_eq!(cache.get_usage(tenant, UsageMetric::Storage).await.unwrap(), 7);
        assert!(fallback.is_degraded());

        // Same TTL semantics as the primary
        seed_usage(&store, tenant, UsageMetric::Storage, 1, now).await;
        assert_eq!(cache.get_usage(tenant, UsageMetric::Storage).await.unwrap(), 7);
        clock.advance(time::Duration::seconds(61));
        assert_eq!(cache.get_usage(tenant, UsageMetric::Storage).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_summary_covers_all_metrics() {
        let store = InMemoryStore::new();
        let now = datetime!(2024-05-10 12:00 UTC);
        let clock = Arc::new(ManualClock::new(now));
        let cache = cache_over(Arc::new(FallbackCache::in_memory(clock.clone())), &store, clock);
        let tenant = TenantId::new();
        let period = BillingPeriod::containing(now);
        store
            .upsert_quota(&UsageQuota::new(tenant, UsageMetric::ApiCalls, 10, true, period))
            .await
            .unwrap();
        seed_usage(&store, tenant, UsageMetric::ApiCalls, 12, now).await;
        seed_usage(&store, tenant, UsageMetric::Tokens, 500, now).await;

        let summary = cache.summary(tenant).await.unwrap();
        assert_eq!(summary.metrics.len(), UsageMetric::ALL.len());
        assert_eq!(summary.total_usage, 512);
        assert_eq!(summary.metrics_over_quota, 1);
        assert_eq!(summary.max_percentage, 120.0);
    }
}
