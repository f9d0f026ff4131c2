use std::panic;
use std::sync::Arc;

use story_collab::config::Config;
use story_collab::db::dbstory::DbStory;
use story_collab::routes::create_app;
use story_collab::services::persistence::{MemoryGateway, PersistenceGateway};
use story_collab::ws::{HubSettings, SessionHub};
use story_collab::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "story_collab=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    if config.jwt_secret.is_none() {
        warn!("No JWT secret configured - every connection will be rejected");
    }

    // Initialize database connection if URL is provided
    let gateway: Arc<dyn PersistenceGateway> = match &config.db_url {
        Some(db_url) => match DbStory::new(db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                Arc::new(db)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to in-memory persistence");
                Arc::new(MemoryGateway::new())
            }
        },
        None => {
            warn!("No database URL configured - edits and locks are kept in memory only");
            Arc::new(MemoryGateway::new())
        }
    };

    let hub = Arc::new(SessionHub::new(gateway, HubSettings::from(&config)));
    let liveness = tokio::spawn(hub.clone().run_liveness(config.heartbeat_interval()));

    let address = config.server_address();
    let is_development = config.is_development();
    let state = Arc::new(AppState { config: Arc::new(config), hub: hub.clone() });
    let app = create_app(state);

    // Start the HTTP/WebSocket server
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    if is_development {
        info!("📚 Swagger UI available at http://{}/swagger", address);
    }

    let shutdown_hub = hub.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown_hub.shutdown().await;
        })
        .await;

    liveness.abort();
    if let Err(e) = served {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    info!("Server stopped");
}
