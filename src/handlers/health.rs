use std::sync::Arc;
use axum::{extract::State, Json};
use crate::AppState;
use crate::models::HealthResponse;
use tracing::debug;

/// Health check endpoint
pub async fn health_check(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        service: app_state.config.service_name.clone(),
        persistence: None,
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    // The session layer degrades to memory-only storage, so it is always ready;
    // the backend name tells operators which mode it runs in.
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Service is ready".to_string(),
        service: app_state.config.service_name.clone(),
        persistence: Some(app_state.hub.persistence_backend().to_string()),
    })
}
