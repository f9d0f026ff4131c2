pub mod api;
pub mod auth_middleware;

use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{docs::ApiDoc, ws::handler::websocket_handler, AppState};
pub use api::create_api_routes;

/// Assemble the full application router.
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origin_list(), state.config.is_development());

    Router::new()
        .route("/ws", get(websocket_handler))
        .nest("/api", create_api_routes(state.clone()))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// No configured origins means permissive in development, closed otherwise.
fn cors_layer(origins: &[String], development: bool) -> CorsLayer {
    if origins.iter().any(|o| o == "*") || (origins.is_empty() && development) {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(allowed).allow_methods(Any).allow_headers(Any)
}
