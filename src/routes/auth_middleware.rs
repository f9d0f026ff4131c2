use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, info};
use crate::AppState;
use crate::models::ErrorResponse;
use crate::services::auth_service::{authenticate, get_auth_token};

pub async fn auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {

    // 1. Get the auth token from the request
    let token = get_auth_token(None, req.headers());

    // 2. Validate it and derive the identity
    let identity = match authenticate(token.as_deref(), app_state.config.jwt_secret.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Request rejected: {}", e);
            let body = ErrorResponse {
                code: StatusCode::UNAUTHORIZED.as_u16(),
                status: "error".to_string(),
                error: "Unauthorized".to_string(),
            };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    };
    info!(user_id = identity.user_id, "API token validated successfully");

    // 3. Set the identity into request extensions for downstream handlers
    req.extensions_mut().insert(identity);

    next.run(req).await
}
