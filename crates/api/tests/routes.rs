//! HTTP tests for the API router
//!
//! Each test builds the router over an in-memory pipeline and drives it with
//! `oneshot`.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use tollbooth_api::{create_router, AppState};
use tollbooth_billing::quota::{HEADER_PERCENTAGE, HEADER_REMAINING};
use tollbooth_billing::webhooks::signature_header;
use tollbooth_billing::{
    BillingPipeline, BillingResult, InMemoryStore, PipelineStores, UsageAggregate, UsageQuota,
    UsageReporter, UsageStore, WebhookEventStore,
};
use tollbooth_shared::{BillingPeriod, Clock, ManualClock, TenantId, UsageMetric};
use tower::ServiceExt;

const SECRET: &str = "whsec_routes_test";
const ADMIN_TOKEN: &str = "admin-token-for-route-tests-0123456789";

struct NoopReporter;

#[async_trait]
impl UsageReporter for NoopReporter {
    async fn report(&self, _aggregate: &UsageAggregate) -> BillingResult<Option<String>> {
        Ok(None)
    }
}

struct TestApp {
    store: InMemoryStore,
    clock: Arc<ManualClock>,
    pipeline: Arc<BillingPipeline>,
    router: Router,
}

fn app(admin_token: Option<&str>) -> TestApp {
    let store = InMemoryStore::new();
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
    let pipeline = Arc::new(
        BillingPipeline::builder(PipelineStores::in_memory(&store), Arc::new(NoopReporter), SECRET)
            .clock(clock.clone())
            .build()
            .unwrap(),
    );
    let state =
        AppState::new(pipeline.clone(), None).with_admin_token(admin_token.map(String::from));
    TestApp {
        store,
        clock,
        pipeline,
        router: create_router(state),
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

fn signed(app: &TestApp, payload: &str) -> Option<String> {
    Some(signature_header(SECRET, app.clock.now().unix_timestamp(), payload).unwrap())
}

fn invoice_event(id: &str) -> String {
    json!({
        "id": id,
        "type": "invoice.paid",
        "data": { "object": { "id": "in_1", "metadata": {} } }
    })
    .to_string()
}

// ============================================================================
// Webhooks
// ============================================================================

#[tokio::test]
async fn test_webhook_acknowledges_and_flags_duplicates() {
    let app = app(None);
    let payload = invoice_event("evt_http_1");

    let first = send(&app.router, webhook_request(&payload, signed(&app, &payload))).await;
    assert_eq!(first.status(), StatusCode::OK);
    let body = json_body(first).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["event_id"], "evt_http_1");
    assert_eq!(body["duplicate"], false);

    let second = send(&app.router, webhook_request(&payload, signed(&app, &payload))).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(json_body(second).await["duplicate"], true);
    assert_eq!(app.store.inbound_count().await, 1);
}

#[tokio::test]
async fn test_webhook_rejects_bad_or_missing_signature() {
    let app = app(None);
    let payload = invoice_event("evt_http_2");

    let missing = send(&app.router, webhook_request(&payload, None)).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let forged =
        signature_header("whsec_other", app.clock.now().unix_timestamp(), &payload).unwrap();
    let bad = send(&app.router, webhook_request(&payload, Some(forged))).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(bad).await["error"]["code"], "BAD_REQUEST");

    assert_eq!(app.store.inbound_count().await, 0);
}

// ============================================================================
// Usage and quota
// ============================================================================

#[tokio::test]
async fn test_usage_event_is_accepted_and_recorded() {
    let app = app(None);
    let tenant = TenantId::new();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/tenants/{}/usage-events", tenant))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "metric": "tokens", "amount": 250, "request_id": "req_1" }).to_string(),
        ))
        .unwrap();
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["accepted"], true);

    let mut events = app.store.usage_events().await;
    for _ in 0..50 {
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        events = app.store.usage_events().await;
    }
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].amount, 250);
    assert_eq!(events[0].metric, UsageMetric::Tokens);
}

#[tokio::test]
async fn test_negative_usage_is_rejected() {
    let app = app(None);
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/tenants/{}/usage-events", TenantId::new()))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "metric": "tokens", "amount": -5 }).to_string()))
        .unwrap();
    assert_eq!(send(&app.router, request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_usage_summary_lists_every_metric() {
    let app = app(None);
    let tenant = TenantId::new();

    let request = Request::builder()
        .uri(format!("/v1/tenants/{}/usage", tenant))
        .body(Body::empty())
        .unwrap();
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["metrics"].as_array().unwrap().len(), UsageMetric::ALL.len());
    assert_eq!(body["total_usage"], 0);
}

#[tokio::test]
async fn test_hard_cap_rejection_is_payment_required() {
    let app = app(None);
    let tenant = TenantId::new();
    let period = BillingPeriod::containing(app.clock.now());
    app.store
        .upsert_quota(&UsageQuota::new(tenant, UsageMetric::ApiCalls, 100, true, period))
        .await
        .unwrap();
    app.pipeline
        .emitter
        .emit(tollbooth_billing::NewUsageEvent::new(tenant, UsageMetric::ApiCalls, 100))
        .await;
    app.pipeline.aggregator.run_once().await.unwrap();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/tenants/{}/quota/api_calls/check", tenant))
        .body(Body::empty())
        .unwrap();
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["error"]["reason"], "hard_cap");
    assert_eq!(body["error"]["usage"], 100);
    assert_eq!(body["error"]["quota"], 100);
}

#[tokio::test]
async fn test_quota_check_allows_under_quota_with_headers() {
    let app = app(None);
    let tenant = TenantId::new();
    let period = BillingPeriod::containing(app.clock.now());
    app.store
        .upsert_quota(&UsageQuota::new(tenant, UsageMetric::Tokens, 100, false, period))
        .await
        .unwrap();
    app.pipeline
        .emitter
        .emit(tollbooth_billing::NewUsageEvent::new(tenant, UsageMetric::Tokens, 40))
        .await;
    app.pipeline.aggregator.run_once().await.unwrap();

    let response = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/tenants/{}/quota/tokens/check", tenant))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(HEADER_REMAINING).unwrap(), "60");
    assert_eq!(response.headers().get(HEADER_PERCENTAGE).unwrap(), "40.0");
    let body = json_body(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["usage"], 40);
    assert_eq!(body["quota"], 100);
    assert_eq!(body["fail_open"], false);
}

#[tokio::test]
async fn test_quota_check_rejects_unknown_metric() {
    let app = app(None);
    let unknown = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/tenants/{}/quota/bandwidth/check", TenantId::new()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Operator routes
// ============================================================================

fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_admin_routes_hidden_without_token() {
    let app = app(None);
    let request = admin_request("GET", "/admin/dead-letters", Some(ADMIN_TOKEN));
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_routes_require_bearer_token() {
    let app = app(Some(ADMIN_TOKEN));

    let missing = send(&app.router, admin_request("GET", "/admin/dead-letters", None)).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = send(&app.router, admin_request("GET", "/admin/dead-letters", Some("nope"))).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let request = admin_request("GET", "/admin/dead-letters", Some(ADMIN_TOKEN));
    let ok = send(&app.router, request).await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(json_body(ok).await, json!([]));
}

#[tokio::test]
async fn test_admin_replays_dead_letter() {
    let app = app(Some(ADMIN_TOKEN));
    let payload = invoice_event("evt_http_dead");
    let signature = signed(&app, &payload).unwrap();
    let ack = app.pipeline.ingress.ingest(&payload, &signature).await.unwrap();

    let inbound = app.store.get_event(ack.inbound_id).await.unwrap().unwrap();
    assert!(app.pipeline.dead_letters.move_to_dead_letter(&inbound).await.unwrap());
    let dead_letter = app.pipeline.dead_letters.list(10, 0).await.unwrap().remove(0);

    let response = send(
        &app.router,
        admin_request(
            "POST",
            &format!("/admin/dead-letters/{}/replay", dead_letter.id),
            Some(ADMIN_TOKEN),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["provider_event_id"], "evt_http_dead");

    assert!(app.pipeline.dead_letters.get(dead_letter.id).await.unwrap().is_none());
    let missing = send(
        &app.router,
        admin_request(
            "POST",
            &format!("/admin/dead-letters/{}/replay", dead_letter.id),
            Some(ADMIN_TOKEN),
        ),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_job_triggers_return_summaries() {
    let app = app(Some(ADMIN_TOKEN));

    let request = admin_request("POST", "/admin/jobs/retry", Some(ADMIN_TOKEN));
    let retry = send(&app.router, request).await;
    assert_eq!(retry.status(), StatusCode::OK);
    assert_eq!(json_body(retry).await["processed"], 0);

    let request = admin_request("POST", "/admin/jobs/aggregate", Some(ADMIN_TOKEN));
    let aggregate = send(&app.router, request).await;
    assert_eq!(aggregate.status(), StatusCode::OK);
    assert_eq!(json_body(aggregate).await["events"], 0);

    let request = admin_request("POST", "/admin/jobs/submit", Some(ADMIN_TOKEN));
    let submit = send(&app.router, request).await;
    assert_eq!(submit.status(), StatusCode::OK);
    assert_eq!(json_body(submit).await["selected"], 0);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_in_memory_store() {
    let app = app(None);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "in_memory");
    assert_eq!(body["cache"], "healthy");

    let request = Request::builder().uri("/health/live").body(Body::empty()).unwrap();
    let live = send(&app.router, request).await;
    assert_eq!(live.status(), StatusCode::OK);
}
