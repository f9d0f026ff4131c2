pub mod clients;
pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod ws;

use std::sync::Arc;

use config::Config;
use ws::SessionHub;

/// Shared state handed to every route.
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<SessionHub>,
}
