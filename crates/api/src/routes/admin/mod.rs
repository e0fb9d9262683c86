//! Operator routes
//!
//! Dead-letter inspection and replay, plus manual triggers for the background
//! jobs. Guarded by a static bearer token; without one configured the routes
//! answer 404 as if they did not exist.

use axum::{
    extract::{Path, Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Json,
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tollbooth_billing::{
    AggregationSummary, BillingError, DeadLetterEvent, ReplayResult, RetryBatchSummary,
    SinkSummary,
};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.admin_token.as_deref().ok_or(ApiError::NotFound)?;

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| tokens_match(token, expected));

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Constant-time token comparison. Only the length can leak.
fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// Dead letters, most recently promoted first
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetterEvent>>, ApiError> {
    let (limit, offset) = query.page();
    let dead_letters = state.pipeline.dead_letters.list(limit, offset).await?;
    Ok(Json(dead_letters))
}

pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeadLetterEvent>, ApiError> {
    state
        .pipeline
        .dead_letters
        .get(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Replay one dead letter. A handler failure is reported in the body with
/// `success: false`; the dead letter stays in place.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayResult>, ApiError> {
    let pipeline = &state.pipeline;
    let dead_letter = pipeline.dead_letters.get(id).await?.ok_or(ApiError::NotFound)?;

    match pipeline.dead_letters.replay(&pipeline.dispatcher, id).await {
        Ok(result) => Ok(Json(result)),
        Err(BillingError::NotFound(_)) => Err(ApiError::NotFound),
        Err(e @ BillingError::Database(_)) => Err(e.into()),
        Err(e) => Ok(Json(ReplayResult {
            dead_letter_id: dead_letter.id,
            provider_event_id: dead_letter.provider_event_id,
            event_type: dead_letter.event_type,
            previous_error: dead_letter.error_message,
            success: false,
            error: Some(e.to_string()),
        })),
    }
}

pub async fn replay_all(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReplayResult>>, ApiError> {
    let (limit, _) = query.page();
    let pipeline = &state.pipeline;
    let results = pipeline
        .dead_letters
        .replay_all(&pipeline.dispatcher, limit)
        .await?;

    let replayed = results.iter().filter(|r| r.success).count();
    tracing::info!(
        attempted = results.len(),
        replayed,
        "Bulk dead letter replay finished"
    );

    Ok(Json(results))
}

pub async fn run_retry_job(
    State(state): State<AppState>,
) -> Result<Json<RetryBatchSummary>, ApiError> {
    Ok(Json(state.pipeline.retry.run_batch().await?))
}

pub async fn run_aggregation_job(
    State(state): State<AppState>,
) -> Result<Json<AggregationSummary>, ApiError> {
    Ok(Json(state.pipeline.aggregator.run_once().await?))
}

pub async fn run_sink_job(State(state): State<AppState>) -> Result<Json<SinkSummary>, ApiError> {
    Ok(Json(state.pipeline.sink.run_once().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("s3cret-admin", "s3cret-admin"));
        assert!(!tokens_match("s3cret-admiN", "s3cret-admin"));
        assert!(!tokens_match("s3cret", "s3cret-admin"));
        assert!(!tokens_match("", "s3cret-admin"));
    }

    #[test]
    fn test_list_query_page_is_clamped() {
        let query = ListQuery {
            limit: Some(10_000),
            offset: Some(-3),
        };
        assert_eq!(query.page(), (MAX_PAGE_SIZE, 0));
        let defaults = ListQuery {
            limit: None,
            offset: None,
        };
        assert_eq!(defaults.page(), (DEFAULT_PAGE_SIZE, 0));
    }
}
