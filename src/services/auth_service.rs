use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation, TokenData};
use tracing::{info, warn};

use crate::models::{SessionError, UserId};

/// Identity attached to a connection for its whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

// Get the auth token from a connection request: query param, then
// Authorization header, then the auth_token cookie.
pub fn get_auth_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    // 1. Query parameter, the only option browsers have for WebSocket upgrades
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    // 2. Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    // 3. Cookie
    let cookie_header = headers.get(http::header::COOKIE)?.to_str().ok()?;
    for cookie in cookie::Cookie::split_parse(cookie_header) {
        if let Ok(c) = cookie {
            if c.name() == "auth_token" {
                return Some(c.value().to_string());
            }
        }
    }
    None
}

/// Validate a credential and derive the connection identity.
///
/// Every failure maps to `Unauthenticated`; the carried reason is for logs.
pub fn authenticate(token: Option<&str>, secret: Option<&str>) -> Result<Identity, SessionError> {
    let token = token.ok_or_else(|| SessionError::Unauthenticated("missing credential".to_string()))?;
    let secret = secret.ok_or_else(|| {
        SessionError::Unauthenticated("no JWT secret configured".to_string())
    })?;

    let token_data = validate_jwt(token, secret)
        .map_err(|e| SessionError::Unauthenticated(format!("JWT validation failed: {}", e)))?;

    let identity = identity_from_claims(&token_data.claims)?;
    info!(user_id = identity.user_id, "Credential validated for {}", identity.username);
    Ok(identity)
}

fn identity_from_claims(claims: &serde_json::Value) -> Result<Identity, SessionError> {
    // Tokens issued by the account service carry `id`; fall back to `sub`.
    let user_id = claims
        .get("id")
        .and_then(|v| v.as_i64())
        .or_else(|| claims.get("sub").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            warn!("JWT token does not contain a usable 'id' claim");
            SessionError::Unauthenticated("missing id claim".to_string())
        })?;

    let username = claims
        .get("username")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SessionError::Unauthenticated("missing username claim".to_string()))?;

    Ok(Identity { user_id, username: username.to_string() })
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}
