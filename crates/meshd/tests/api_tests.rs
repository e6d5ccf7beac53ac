//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use mesh_lib::{health::stages, PipelineHealth, PipelineMetrics};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Clone)]
pub struct AppState {
    pub health: PipelineHealth,
    pub metrics: PipelineMetrics,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.health();
    let status_code = if report.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(report))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness();
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn setup_test_app() -> (Router, Arc<AppState>) {
    let health = PipelineHealth::new();
    health.register(stages::OPTIMIZER, None);
    health.register(stages::CONTROLLER, None);

    let metrics = PipelineMetrics::new();
    let state = Arc::new(AppState { health, metrics });
    let router = create_test_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthz_returns_ok_with_stage_details() {
    let (app, _state) = setup_test_app();

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["stages"]["optimizer"]["status"], "ok");
    assert_eq!(body["stages"]["controller"]["status"], "ok");
    // No activity yet, so no idle time is reported.
    assert!(body["stages"]["optimizer"].get("idle_seconds").is_none());
}

#[tokio::test]
async fn healthz_reports_stalled_stage_as_operational() {
    let (app, state) = setup_test_app();

    // A cadenced stage with no heartbeats goes stalled, not dead.
    state
        .health
        .register(stages::AGGREGATOR, Some(Duration::from_millis(10)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stalled");
    assert_eq!(body["stages"]["aggregator"]["status"], "stalled");
    assert!(body["stages"]["aggregator"]["detail"]
        .as_str()
        .unwrap()
        .contains("no activity"));
}

#[tokio::test]
async fn healthz_returns_503_when_stage_failed() {
    let (app, state) = setup_test_app();

    state
        .health
        .mark_failed(stages::OPTIMIZER, "forecasts topic closed");

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "failed");
    assert_eq!(
        body["stages"]["optimizer"]["detail"],
        "forecasts topic closed"
    );
    // The other stage stays healthy in the same report.
    assert_eq!(body["stages"]["controller"]["status"], "ok");
}

#[tokio::test]
async fn heartbeat_restores_stalled_stage() {
    let (app, state) = setup_test_app();

    state
        .health
        .register(stages::AGGREGATOR, Some(Duration::from_millis(10)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    state.health.heartbeat(stages::AGGREGATOR);

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["stages"]["aggregator"]["idle_seconds"], 0);
}

#[tokio::test]
async fn readyz_returns_503_before_start() {
    let (app, _state) = setup_test_app();

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert!(body["reason"].as_str().is_some());
}

#[tokio::test]
async fn readyz_returns_ok_when_started() {
    let (app, state) = setup_test_app();

    state.health.set_started(true);

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn readyz_returns_503_when_started_but_stage_failed() {
    let (app, state) = setup_test_app();

    state.health.set_started(true);
    state
        .health
        .mark_failed(stages::CONTROLLER, "chconfigs topic closed");

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert!(body["reason"].as_str().unwrap().contains("controller"));
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters_and_histogram() {
    let (app, state) = setup_test_app();

    state.metrics.inc_features_published();
    state.metrics.observe_aggregation_tick(0.012);
    state.metrics.set_channel_load(6, 20.0);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("mesh_features_published_total"));
    assert!(text.contains("mesh_aggregation_tick_seconds_bucket"));
    assert!(text.contains("mesh_channel_load"));
}
