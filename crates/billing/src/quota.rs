//! Request-time quota enforcement
//!
//! Under quota: allow with informational headers, plus a warning once usage
//! crosses the warning threshold. Over a hard cap: reject. Over a soft cap:
//! allow inside a grace window (opening one if needed) and reject once the
//! window for the current period has run out.
//!
//! Fails open: any infrastructure error allows the request and is logged.

use serde::Serialize;
use time::OffsetDateTime;
use tollbooth_shared::{TenantId, UsageMetric};

use crate::cache::{UsageCache, UsageSnapshot};
use crate::error::{BillingError, BillingResult, QuotaRejection};
use crate::grace::GracePeriodManager;

pub const HEADER_REMAINING: &str = "X-Quota-Remaining";
pub const HEADER_PERCENTAGE: &str = "X-Quota-Percentage";
pub const HEADER_WARNING: &str = "X-Quota-Warning";
pub const HEADER_METRIC: &str = "X-Quota-Metric";
pub const HEADER_USAGE: &str = "X-Quota-Usage";
pub const HEADER_LIMIT: &str = "X-Quota-Limit";
pub const HEADER_GRACE_EXPIRES: &str = "X-Quota-Grace-Expires";

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub metric: UsageMetric,
    pub usage: Option<i64>,
    pub quota: Option<i64>,
    /// Response headers to attach, in order
    pub headers: Vec<(&'static str, String)>,
    pub rejection: Option<QuotaRejection>,
    /// Allowed because the check itself could not run
    pub fail_open: bool,
}

impl QuotaDecision {
    fn allow(
        metric: UsageMetric,
        snapshot: &UsageSnapshot,
        headers: Vec<(&'static str, String)>,
    ) -> Self {
        Self {
            allowed: true,
            metric,
            usage: Some(snapshot.usage),
            quota: snapshot.quota,
            headers,
            rejection: None,
            fail_open: false,
        }
    }

    fn reject(metric: UsageMetric, snapshot: &UsageSnapshot, reason: QuotaRejection) -> Self {
        Self {
            allowed: false,
            metric,
            usage: Some(snapshot.usage),
            quota: snapshot.quota,
            headers: Vec::new(),
            rejection: Some(reason),
            fail_open: false,
        }
    }

    fn fail_open(metric: UsageMetric) -> Self {
        Self {
            allowed: true,
            metric,
            usage: None,
            quota: None,
            headers: Vec::new(),
            rejection: None,
            fail_open: true,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The rejection as a `QuotaExceeded` error
    pub fn to_error(&self) -> Option<BillingError> {
        self.rejection.map(|reason| BillingError::QuotaExceeded {
            reason,
            metric: self.metric,
            usage: self.usage.unwrap_or_default(),
            quota: self.quota.unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    cache: UsageCache,
    grace: GracePeriodManager,
    warning_percent: f64,
}

impl QuotaEnforcer {
    pub fn new(cache: UsageCache, grace: GracePeriodManager, warning_percent: f64) -> Self {
        Self {
            cache,
            grace,
            warning_percent,
        }
    }

    /// Admission check for one metered request
    pub async fn check(&self, tenant_id: TenantId, metric: UsageMetric) -> QuotaDecision {
        match self.evaluate(tenant_id, metric).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    metric = %metric,
                    error = %e,
                    "Quota check failed, allowing request"
                );
                QuotaDecision::fail_open(metric)
            }
        }
    }

    /// Like [`check`](Self::check) but a rejection becomes `Err(QuotaExceeded)`
    pub async fn enforce(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<QuotaDecision> {
        let decision = self.check(tenant_id, metric).await;
        match decision.to_error() {
            Some(err) => Err(err),
            None => Ok(decision),
        }
    }

    async fn evaluate(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<QuotaDecision> {
        let snapshot = self.cache.snapshot(tenant_id, metric).await?;
        let Some(limit) = snapshot.quota else {
            return Ok(QuotaDecision::allow(metric, &snapshot, Vec::new()));
        };

        if !snapshot.over_quota {
            let mut headers = vec![
                (HEADER_REMAINING, snapshot.remaining.unwrap_or_default().to_string()),
                (HEADER_PERCENTAGE, format!("{:.1}", snapshot.percentage)),
            ];
            if snapshot.percentage >= self.warning_percent {
                headers.extend(warning_headers(&snapshot, limit));
            }
            return Ok(QuotaDecision::allow(metric, &snapshot, headers));
        }

        if snapshot.hard_cap {
            tracing::info!(
                tenant_id = %tenant_id,
                metric = %metric,
                usage = snapshot.usage,
                quota = limit,
                "Hard cap reached, rejecting request"
            );
            return Ok(QuotaDecision::reject(metric, &snapshot, QuotaRejection::HardCap));
        }

        if let Some(active) = self.grace.get_active(tenant_id, metric).await? {
            if !active.notified {
                self.notify_grace(tenant_id, metric).await;
            }
            return Ok(QuotaDecision::allow(
                metric,
                &snapshot,
                grace_headers(&snapshot, limit, active.expires_at),
            ));
        }

        // A window from this period that has run out means the grace is spent
        let latest = self.grace.get_latest(tenant_id, metric).await?;
        if latest.is_some_and(|g| g.started_at >= snapshot.period_start) {
            tracing::info!(
                tenant_id = %tenant_id,
                metric = %metric,
                usage = snapshot.usage,
                quota = limit,
                "Grace period expired, rejecting request"
            );
            return Ok(QuotaDecision::reject(
                metric,
                &snapshot,
                QuotaRejection::GraceExpired,
            ));
        }

        let started = self
            .grace
            .start(tenant_id, metric, snapshot.usage, limit)
            .await?;
        self.notify_grace(tenant_id, metric).await;
        Ok(QuotaDecision::allow(
            metric,
            &snapshot,
            grace_headers(&snapshot, limit, started.expires_at),
        ))
    }

    /// The warning headers on this response are the tenant's notice
    async fn notify_grace(&self, tenant_id: TenantId, metric: UsageMetric) {
        match self.grace.mark_notified(tenant_id, metric).await {
            Ok(true) => tracing::warn!(
                tenant_id = %tenant_id,
                metric = %metric,
                "Tenant over soft cap, grace warning issued"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                metric = %metric,
                error = %e,
                "Failed to record grace notification"
            ),
        }
    }
}

fn warning_headers(snapshot: &UsageSnapshot, limit: i64) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_WARNING, "true".to_string()),
        (HEADER_METRIC, snapshot.metric.to_string()),
        (HEADER_USAGE, snapshot.usage.to_string()),
        (HEADER_LIMIT, limit.to_string()),
    ]
}

fn grace_headers(
    snapshot: &UsageSnapshot,
    limit: i64,
    expires_at: OffsetDateTime,
) -> Vec<(&'static str, String)> {
    let mut headers = warning_headers(snapshot, limit);
    headers.push((HEADER_GRACE_EXPIRES, expires_at.unix_timestamp().to_string()));
    headers
}
