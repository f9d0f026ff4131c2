mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{test_config, token};
use serde_json::Value;
use std::sync::Arc;
use story_collab::routes::create_app;
use story_collab::services::persistence::MemoryGateway;
use story_collab::ws::{HubSettings, SessionHub};
use story_collab::AppState;
use tower::ServiceExt;

fn app() -> axum::Router {
    app_with(test_config())
}

fn app_with(config: story_collab::config::Config) -> axum::Router {
    let hub = Arc::new(SessionHub::new(Arc::new(MemoryGateway::new()), HubSettings::from(&config)));
    create_app(Arc::new(AppState { config: Arc::new(config), hub }))
}

async fn get(uri: &str, bearer: Option<String>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(bearer) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    let response = app().oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_and_ready() {
    let (status, body) = get("/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body.get("persistence").is_none());

    let (status, body) = get("/api/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persistence"], "memory");
}

#[tokio::test]
async fn diagnostics_requires_a_bearer_token() {
    let (status, body) = get("/api/v1/diagnostics", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = get("/api/v1/diagnostics", Some("garbage".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn diagnostics_reports_session_counters() {
    let (status, body) = get("/api/v1/diagnostics", Some(token(1, "ann"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["n_conn"], 0);
    assert_eq!(body["n_locks"], 0);
    assert_eq!(body["n_lock_divergences"], 0);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (status, body) = get("/api-docs/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/v1/diagnostics"].is_object());
}

async fn allowed_origin(app: axum::Router, origin: &str) -> Option<String> {
    let request = Request::builder()
        .uri("/api/health")
        .header(header::ORIGIN, origin)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn development_without_origins_allows_any_origin() {
    assert_eq!(allowed_origin(app(), "http://localhost:5173").await.as_deref(), Some("*"));
}

#[tokio::test]
async fn production_without_origins_allows_none() {
    let config = story_collab::config::Config { environment: "production".to_string(), ..test_config() };
    assert_eq!(allowed_origin(app_with(config), "http://localhost:5173").await, None);
}

#[tokio::test]
async fn configured_origins_are_honoured() {
    let config = story_collab::config::Config {
        environment: "production".to_string(),
        cors_origins: Some("https://stories.example.com".to_string()),
        ..test_config()
    };
    assert_eq!(
        allowed_origin(app_with(config.clone()), "https://stories.example.com").await.as_deref(),
        Some("https://stories.example.com")
    );
    assert_eq!(allowed_origin(app_with(config), "http://evil.example.com").await, None);
}
