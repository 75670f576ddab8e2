use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use opora_agent::history::HistoryCaseEntry;
use opora_agent::AgentError;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct QrReadyRequest {
    pub token: String,
    pub qr_png_base64: String,
}

/// POST /history/qr-ready — collaborator callback with the login QR. The
/// QR is forwarded to the admin who owns the token, by DM.
pub async fn qr_ready_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QrReadyRequest>,
) -> Result<Json<Value>, StatusCode> {
    let deps = &state.deps;
    let token = deps
        .store
        .get_history_token(&req.token)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::FORBIDDEN)?;
    if !token.is_usable(opora_core::now_ms()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let png = base64::engine::general_purpose::STANDARD
        .decode(&req.qr_png_base64)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    opora_agent::admin::deliver_qr(deps, &token.admin_id, &png)
        .await
        .map_err(|e| {
            warn!("qr delivery failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct HistoryCasesRequest {
    pub token: String,
    #[serde(default)]
    pub cases: Vec<HistoryCaseEntry>,
}

/// POST /history/cases — the bootstrap payload: extracted case blocks from
/// the group's past. Validates and consumes the single-use token.
pub async fn cases_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HistoryCasesRequest>,
) -> Result<Json<Value>, StatusCode> {
    match opora_agent::history::ingest_history_cases(&state.deps, &req.token, req.cases).await {
        Ok(imported) => Ok(Json(json!({"ok": true, "imported": imported}))),
        Err(AgentError::TokenRejected(reason)) => {
            warn!(%reason, "history cases rejected");
            Err(StatusCode::FORBIDDEN)
        }
        Err(e) => {
            warn!("history ingestion failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
