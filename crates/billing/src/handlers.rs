//! Provider event handlers registered with the dispatcher
//!
//! Both handlers are idempotent: the audit trail is keyed by provider event id,
//! plan writes are upserts and cache invalidation is naturally repeatable.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tollbooth_shared::{BillingPeriod, TenantId, UsageMetric};
use uuid::Uuid;

use crate::cache::UsageCache;
use crate::dispatcher::EventHandler;
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::models::{InboundEvent, UsageQuota};
use crate::store::UsageStore;

/// Tenant carried in `data.object.metadata.tenant_id`
pub fn tenant_from_payload(payload: &Value) -> Option<TenantId> {
    payload
        .pointer("/data/object/metadata/tenant_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(TenantId)
}

fn object_id(payload: &Value) -> Option<&str> {
    payload.pointer("/data/object/id").and_then(Value::as_str)
}

/// Appends invoice, payment and charge events to the billing audit trail
#[derive(Clone)]
pub struct AuditTrailHandler {
    events: BillingEventLogger,
}

impl AuditTrailHandler {
    pub fn new(events: BillingEventLogger) -> Self {
        Self { events }
    }
}

#[async_trait]
impl EventHandler for AuditTrailHandler {
    async fn handle(&self, event: &InboundEvent) -> BillingResult<()> {
        let Some(event_type) = BillingEventType::from_provider(&event.event_type) else {
            tracing::debug!(
                event_id = %event.provider_event_id,
                event_type = %event.event_type,
                "No audit mapping for event type"
            );
            return Ok(());
        };

        let tenant_id = tenant_from_payload(&event.payload);
        let mut builder = BillingEventBuilder::new(event_type, &event.provider_event_id)
            .tenant(tenant_id)
            .data(
                event
                    .payload
                    .pointer("/data/object")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({})),
            );
        if let Some(object_id) = object_id(&event.payload) {
            builder = builder.provider_object(object_id);
        }

        if self.events.log_event(builder).await? {
            tracing::info!(
                event_id = %event.provider_event_id,
                event_type = %event_type,
                tenant_id = ?tenant_id,
                "Billing event recorded"
            );
        }
        Ok(())
    }
}

/// Subscription object fields read from `data.object`. Stripe metadata values
/// are always strings.
#[derive(Debug, Default, Deserialize)]
struct SubscriptionObject {
    #[serde(default)]
    items: ItemList,
}

#[derive(Debug, Default, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemObject {
    id: String,
    #[serde(default)]
    price: Option<PriceObject>,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    #[serde(default)]
    recurring: Option<RecurringObject>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RecurringObject {
    #[serde(default)]
    usage_type: Option<String>,
}

/// What one subscription item contributes to the tenant's plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanItem {
    pub subscription_item_id: String,
    pub metric: UsageMetric,
    /// Usage reported against this item instead of a fixed quantity
    pub metered: bool,
    pub quota: Option<i64>,
    pub hard_cap: bool,
}

/// Items whose price carries a `metric` metadata key. Unknown metrics and items
/// without one are skipped.
pub fn plan_items(payload: &Value) -> Vec<PlanItem> {
    let Some(object) = payload.pointer("/data/object") else {
        return Vec::new();
    };
    let subscription: SubscriptionObject =
        serde_json::from_value(object.clone()).unwrap_or_default();

    subscription
        .items
        .data
        .into_iter()
        .filter_map(|item| {
            let price = item.price?;
            let metric = price.metadata.get("metric")?.parse::<UsageMetric>().ok()?;
            Some(PlanItem {
                subscription_item_id: item.id,
                metric,
                metered: price
                    .recurring
                    .and_then(|r| r.usage_type)
                    .is_some_and(|usage_type| usage_type == "metered"),
                quota: price
                    .metadata
                    .get("quota")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .filter(|quota| *quota >= 0),
                hard_cap: price
                    .metadata
                    .get("hard_cap")
                    .is_some_and(|raw| raw.eq_ignore_ascii_case("true")),
            })
        })
        .collect()
}

/// Subscription lifecycle: audit, record metered items and quotas from the
/// subscription's prices, then drop the tenant's cached quotas so plan changes
/// take effect on the next check
#[derive(Clone)]
pub struct SubscriptionHandler {
    audit: AuditTrailHandler,
    cache: UsageCache,
    usage: Arc<dyn UsageStore>,
}

impl SubscriptionHandler {
    pub fn new(audit: AuditTrailHandler, cache: UsageCache, usage: Arc<dyn UsageStore>) -> Self {
        Self {
            audit,
            cache,
            usage,
        }
    }

    async fn apply_plan(&self, tenant_id: TenantId, event: &InboundEvent) -> BillingResult<()> {
        let period = BillingPeriod::containing(event.received_at);
        for item in plan_items(&event.payload) {
            if item.metered {
                self.usage
                    .set_subscription_item(tenant_id, item.metric, &item.subscription_item_id)
                    .await?;
                tracing::info!(
                    tenant_id = %tenant_id,
                    metric = %item.metric,
                    subscription_item_id = %item.subscription_item_id,
                    "Metered subscription item registered"
                );
            }
            if let Some(quota) = item.quota {
                self.usage
                    .upsert_quota(&UsageQuota::new(
                        tenant_id,
                        item.metric,
                        quota,
                        item.hard_cap,
                        period,
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SubscriptionHandler {
    async fn handle(&self, event: &InboundEvent) -> BillingResult<()> {
        self.audit.handle(event).await?;

        match tenant_from_payload(&event.payload) {
            Some(tenant_id) => {
                // A canceled subscription keeps its items so held usage can still be reported
                if event.event_type != "customer.subscription.deleted" {
                    self.apply_plan(tenant_id, event).await?;
                }
                self.cache.invalidate_tenant(tenant_id).await;
                tracing::info!(
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    tenant_id = %tenant_id,
                    "Subscription changed, quota cache invalidated"
                );
            }
            None => {
                tracing::warn!(
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    "Subscription event without tenant metadata"
                );
            }
        }
        Ok(())
    }
}
