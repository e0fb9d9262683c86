//! Usage tracking API routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tollbooth_billing::{NewUsageEvent, UsageSummary};
use tollbooth_shared::{TenantId, UsageMetric};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Usage event posted by a metered service
#[derive(Debug, Deserialize)]
pub struct UsageEventRequest {
    pub metric: UsageMetric,
    pub amount: i64,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct UsageEventAccepted {
    pub accepted: bool,
}

/// Current-period usage, quota, percentage and remaining for every metric
pub async fn get_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<UsageSummary>, ApiError> {
    let summary = state.pipeline.cache.summary(TenantId(tenant_id)).await?;
    Ok(Json(summary))
}

/// Fire-and-forget usage recording
///
/// Accepted as soon as the body parses; storage failures are logged by the
/// emitter and never reach the caller.
pub async fn record_usage_event(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<UsageEventRequest>,
) -> Result<(StatusCode, Json<UsageEventAccepted>), ApiError> {
    if body.amount < 0 {
        return Err(ApiError::BadRequest("amount must not be negative".to_string()));
    }

    let mut event = NewUsageEvent::new(TenantId(tenant_id), body.metric, body.amount);
    if let Some(request_id) = body.request_id {
        event = event.request_id(request_id);
    }
    if let Some(metadata) = body.metadata {
        event = event.metadata(metadata);
    }

    state.pipeline.emitter.spawn_emit(event);

    Ok((StatusCode::ACCEPTED, Json(UsageEventAccepted { accepted: true })))
}
