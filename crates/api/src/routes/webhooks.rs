//! Stripe webhook endpoint
//!
//! Every failure is a 400. A 5xx would make Stripe redeliver, and events that
//! were stored are already safe with the retry scheduler.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event_id: String,
    pub duplicate: bool,
}

/// Verify, store and acknowledge a Stripe event
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let ack = state
        .pipeline
        .ingress
        .ingest(&body, signature)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::BadRequest(e.to_string())
        })?;

    tracing::info!(
        event_id = %ack.event_id,
        duplicate = ack.duplicate,
        "Stripe webhook acknowledged"
    );

    Ok(Json(WebhookAck {
        received: true,
        event_id: ack.event_id,
        duplicate: ack.duplicate,
    }))
}
