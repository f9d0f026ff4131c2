use crate::{AppState, models::DiagnosticsResponse, services::auth_service::Identity};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Session layer and host diagnostics
pub async fn diagnostics(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> (StatusCode, Json<DiagnosticsResponse>) {

    let snapshot = app_state.hub.snapshot().await;
    let n_display_names = app_state.hub.display_names().entry_count();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics for {}: CPU: {:.2}%, Mem: {}/{} MB, Conn: {} ({} live), Locks: {}, Divergences: {}",
        identity.username,
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        snapshot.n_conn,
        snapshot.n_live_conn,
        snapshot.n_locks,
        snapshot.n_lock_divergences
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn: snapshot.n_conn as u32,
            n_live_conn: snapshot.n_live_conn as u32,
            n_stories: snapshot.n_stories as u32,
            n_locks: snapshot.n_locks as u32,
            n_typing: snapshot.n_typing as u32,
            n_display_names: n_display_names as u32,
            n_lock_divergences: snapshot.n_lock_divergences,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
