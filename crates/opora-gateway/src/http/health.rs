use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /health — liveness probe with queue depth and index size.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let depth = state.deps.queue.depth().unwrap_or(0);
    let indexed = state.deps.index.count().unwrap_or(0);
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "started_at": state.started_at,
        "queue_depth": depth,
        "indexed_cases": indexed,
        "workers": state.deps.config.queue.workers,
    }))
}
