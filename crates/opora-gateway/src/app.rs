use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use opora_agent::Deps;

use crate::http;

/// Shared state for all axum handlers.
pub struct AppState {
    pub deps: Arc<Deps>,
    pub started_at: i64,
}

impl AppState {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            started_at: opora_core::now_ms(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health::health_handler))
        .route("/events", post(http::events::events_handler))
        .route("/history/qr-ready", post(http::history::qr_ready_handler))
        .route("/history/cases", post(http::history::cases_handler))
        .route("/api/cases/{case_id}", get(http::viewer::case_handler))
        .route("/static/{*path}", get(http::viewer::static_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
