use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use opora_core::types::CaseId;

use crate::app::AppState;

/// GET /api/cases/{case_id} — read-only case view with evidence messages.
pub async fn case_handler(
    State(state): State<Arc<AppState>>,
    Path(case_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let id = CaseId::from(case_id);
    let Some((case, evidence)) = state
        .deps
        .store
        .get_case_with_evidence(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    else {
        return Err(StatusCode::NOT_FOUND);
    };

    let base = state
        .deps
        .config
        .server
        .public_base_url
        .trim_end_matches('/');
    let evidence_json: Vec<Value> = evidence
        .iter()
        .map(|m| {
            json!({
                "message_id": m.message_id,
                "ts": m.ts,
                "sender_hash": m.sender_hash,
                "sender_name": m.sender_name,
                "content_text": m.content_text,
                "images": m
                    .image_paths
                    .iter()
                    .map(|p| format!("{base}/static/{p}"))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(Json(json!({
        "case_id": case.case_id.as_str(),
        "problem_title": case.problem_title,
        "problem_summary": case.problem_summary,
        "solution_summary": case.solution_summary,
        "status": case.status.to_string(),
        "created_at": case.created_at,
        "closed_emoji": case.closed_emoji,
        "tags": case.tags,
        "evidence": evidence_json,
    })))
}

/// GET /static/{*path} — stored image bytes. Rejects any path that would
/// escape the images root.
pub async fn static_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let root = &state.deps.config.images.root;
    let full = resolve_under_root(root, &path).ok_or(StatusCode::FORBIDDEN)?;
    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let content_type = match full.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

/// Join a request path under the images root, refusing absolute paths and
/// parent-directory components.
fn resolve_under_root(root: &str, rel: &str) -> Option<PathBuf> {
    let rel_path = FsPath::new(rel);
    if rel_path.is_absolute() {
        return None;
    }
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(FsPath::new(root).join(rel_path))
}
