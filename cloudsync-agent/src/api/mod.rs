//! Read-only diagnostics API.

pub mod diagnostics;
pub mod health;

use crate::engine::SyncEngine;
use crate::faults::FaultReporter;
use crate::model::Backup;
use crate::watch::WatchRegistry;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent_id: String,
    pub started: Instant,
    pub backups: Vec<Backup>,
    pub registry: WatchRegistry,
    pub engine: Arc<SyncEngine>,
    pub faults: FaultReporter,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Diagnostics
        .route("/watches", get(diagnostics::watches))
        .route("/faults", get(diagnostics::faults))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn serve(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Diagnostics API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::dispatch::task_queue;
    use crate::index::MemoryIndex;

    let (dispatcher, _receiver) = task_queue();
    AppState {
        agent_id: "agent-01".into(),
        started: Instant::now(),
        backups: vec![Backup::new("photos", "/data/photos")],
        registry: WatchRegistry::new(),
        engine: SyncEngine::new(Arc::new(MemoryIndex::new()), dispatcher),
        faults: FaultReporter::new(),
    }
}
