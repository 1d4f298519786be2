//! HTTP API gateway for Luna Villa.
//!
//! Exposes the chat stream, stats, the domain-event log and a health check.
//!
//! Built on Axum for async HTTP with SSE.

pub mod api;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lunavilla_agent::{OrchestratorSettings, TurnOrchestrator};
use lunavilla_config::AppConfig;
use lunavilla_core::event::EventBus;
use lunavilla_store::SqliteStore;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: AppConfig,
    pub orchestrator: TurnOrchestrator,
    /// Cancelled on shutdown; every chat stream holds a child token.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
///
/// Layers applied:
/// - Request body size limit (`gateway.body_limit_mb`, images travel inline)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.config.gateway.body_limit_mb * 1024 * 1024;

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api::api_router(state))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open (or create) the configured SQLite database.
pub async fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStore::new(&db_path.to_string_lossy()).await?))
}

/// Open the store, build the provider and wire up the turn orchestrator.
pub async fn build_orchestrator(
    config: &AppConfig,
    event_bus: Arc<EventBus>,
) -> Result<TurnOrchestrator, Box<dyn std::error::Error>> {
    let provider = lunavilla_providers::build_from_config(config)?;
    let store = open_store(config).await?;

    Ok(TurnOrchestrator::new(
        provider,
        store.clone(),
        store,
        event_bus,
        OrchestratorSettings::from_config(config),
    ))
}

/// Start the gateway HTTP server.
///
/// Runs until Ctrl-C; in-flight chat streams are cancelled and commit
/// whatever reply text they already received.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let event_bus = Arc::new(EventBus::default());
    let orchestrator = build_orchestrator(&config, event_bus).await?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(GatewayState {
        config,
        orchestrator,
        shutdown: shutdown.clone(),
    });

    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutting down gateway");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
