use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Failures a persistence gateway can report.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("persistence call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("{0} not found")]
    NotFound(String),
}

/// Failures surfaced by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing, invalid or expired credential. The cause is kept for logs only.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
