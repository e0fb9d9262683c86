//! Quota admission check
//!
//! Metered services call this before doing work. The quota headers are copied
//! onto the response whether the request is allowed or rejected.

use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tollbooth_billing::QuotaDecision;
use tollbooth_shared::{TenantId, UsageMetric};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
pub struct QuotaCheckResponse {
    pub allowed: bool,
    pub metric: UsageMetric,
    pub usage: Option<i64>,
    pub quota: Option<i64>,
    /// The check could not run and the request was let through
    pub fail_open: bool,
}

fn apply_headers(mut response: Response, decision: &QuotaDecision) -> Response {
    for (name, value) in &decision.headers {
        match (HeaderName::try_from(*name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = name, "Skipping unencodable quota header"),
        }
    }
    response
}

pub async fn check_quota(
    State(state): State<AppState>,
    Path((tenant_id, metric)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let metric: UsageMetric = metric
        .parse()
        .map_err(|e: tollbooth_shared::SharedError| ApiError::BadRequest(e.to_string()))?;

    let decision = state.pipeline.quota.check(TenantId(tenant_id), metric).await;

    let response = match decision.to_error() {
        Some(err) => ApiError::from(err).into_response(),
        None => Json(QuotaCheckResponse {
            allowed: decision.allowed,
            metric,
            usage: decision.usage,
            quota: decision.quota,
            fail_open: decision.fail_open,
        })
        .into_response(),
    };

    Ok(apply_headers(response, &decision))
}
