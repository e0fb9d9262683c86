//! Billing Events Module
//!
//! Append-only audit trail of provider events the dispatcher has handled.
//! Entries are keyed by provider event id, so recording the same delivery twice
//! (a retry after a partial failure, or a manual replay) leaves one row.
//!
//! ## Event Types
//!
//! - Invoicing: created, finalized, paid, payment failed
//! - Payments: succeeded, failed
//! - Subscription lifecycle: created, updated, canceled
//! - Charges: succeeded, failed, refunded, disputed

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tollbooth_shared::{Clock, TenantId};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingEventStore;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Invoicing
    InvoiceCreated,
    InvoiceFinalized,
    InvoicePaid,
    InvoicePaymentFailed,

    // Payments
    PaymentSucceeded,
    PaymentFailed,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,

    // Charges
    ChargeSucceeded,
    ChargeFailed,
    ChargeRefunded,
    DisputeCreated,
}

impl BillingEventType {
    /// Map a provider event type string
    pub fn from_provider(event_type: &str) -> Option<Self> {
        let mapped = match event_type {
            "invoice.created" => BillingEventType::InvoiceCreated,
            "invoice.finalized" => BillingEventType::InvoiceFinalized,
            "invoice.paid" | "invoice.payment_succeeded" => BillingEventType::InvoicePaid,
            "invoice.payment_failed" => BillingEventType::InvoicePaymentFailed,
            "payment_intent.succeeded" => BillingEventType::PaymentSucceeded,
            "payment_intent.payment_failed" => BillingEventType::PaymentFailed,
            "customer.subscription.created" => BillingEventType::SubscriptionCreated,
            "customer.subscription.updated" => BillingEventType::SubscriptionUpdated,
            "customer.subscription.deleted" => BillingEventType::SubscriptionCanceled,
            "charge.succeeded" => BillingEventType::ChargeSucceeded,
            "charge.failed" => BillingEventType::ChargeFailed,
            "charge.refunded" => BillingEventType::ChargeRefunded,
            "charge.dispute.created" => BillingEventType::DisputeCreated,
            _ => return None,
        };
        Some(mapped)
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::InvoiceCreated => "INVOICE_CREATED",
            BillingEventType::InvoiceFinalized => "INVOICE_FINALIZED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoicePaymentFailed => "INVOICE_PAYMENT_FAILED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::ChargeSucceeded => "CHARGE_SUCCEEDED",
            BillingEventType::ChargeFailed => "CHARGE_FAILED",
            BillingEventType::ChargeRefunded => "CHARGE_REFUNDED",
            BillingEventType::DisputeCreated => "DISPUTE_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// A billing event record
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub provider_event_id: String,
    pub provider_object_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    event_type: BillingEventType,
    provider_event_id: String,
    tenant_id: Option<TenantId>,
    event_data: serde_json::Value,
    provider_object_id: Option<String>,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(event_type: BillingEventType, provider_event_id: impl Into<String>) -> Self {
        Self {
            event_type,
            provider_event_id: provider_event_id.into(),
            tenant_id: None,
            event_data: serde_json::json!({}),
            provider_object_id: None,
        }
    }

    pub fn tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the provider object (invoice, subscription, charge) the event refers to
    pub fn provider_object(mut self, object_id: impl Into<String>) -> Self {
        self.provider_object_id = Some(object_id.into());
        self
    }

    fn build(self, created_at: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id.map(|t| t.0),
            event_type: self.event_type.to_string(),
            event_data: self.event_data,
            provider_event_id: self.provider_event_id,
            provider_object_id: self.provider_object_id,
            created_at,
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingEventStore>,
    clock: Arc<dyn Clock>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingEventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record an event. Returns `false` if this provider event was already logged.
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<bool> {
        let event = builder.build(self.clock.now());
        let inserted = self.store.record_billing_event(&event).await?;
        if !inserted {
            tracing::debug!(
                provider_event_id = %event.provider_event_id,
                event_type = %event.event_type,
                "Billing event already recorded"
            );
        }
        Ok(inserted)
    }

    /// Get recent events for a tenant
    pub async fn get_events_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.store.billing_events_for_tenant(tenant_id, limit).await
    }
}
