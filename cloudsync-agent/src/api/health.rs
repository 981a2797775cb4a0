//! Health check endpoints.

use super::AppState;
use axum::{extract::State, Json};
use serde_json::{json, Value};

/// GET /health - Health check endpoint
///
/// Reports `degraded` once no directory is watched any more.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let watches = state.registry.len();
    let status = if watches == 0 { "degraded" } else { "ok" };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": state.agent_id,
        "uptime_secs": state.started.elapsed().as_secs(),
        "backups": state.backups.len(),
        "watches": watches,
        "tasks": state.engine.stats(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build": "dev",
        "features": ["zstd", "sqlite"],
    }))
}
