use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_conn: u32,
    pub n_live_conn: u32,
    pub n_stories: u32,
    pub n_locks: u32,
    pub n_typing: u32,
    pub n_display_names: u32,
    pub n_lock_divergences: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
