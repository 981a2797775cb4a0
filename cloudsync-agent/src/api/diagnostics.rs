//! Watch coverage and fault history.

use super::AppState;
use crate::faults::Fault;
use crate::watch::Registration;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FaultQuery {
    /// Only the newest `limit` faults
    pub limit: Option<usize>,
}

/// GET /watches - Current watch registrations
pub async fn watches(State(state): State<AppState>) -> Json<Vec<Registration>> {
    Json(state.registry.snapshot())
}

/// GET /faults?limit=N - Recent faults, oldest first
pub async fn faults(
    State(state): State<AppState>,
    Query(query): Query<FaultQuery>,
) -> Json<Vec<Fault>> {
    let mut recent = state.faults.recent();
    if let Some(limit) = query.limit {
        let skip = recent.len().saturating_sub(limit);
        recent.drain(..skip);
    }
    Json(recent)
}
