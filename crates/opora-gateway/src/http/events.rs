use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use opora_core::event::InboundEvent;

use crate::app::AppState;

/// POST /events — inbound event sink for the transport adapter.
///
/// Processed inline: a non-2xx response tells the adapter to keep the
/// event in its backlog and redeliver, which is what gives the ingest
/// path its at-least-once guarantee.
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<Value>, StatusCode> {
    let deps = &state.deps;
    let result = match event {
        InboundEvent::Message(msg) if msg.is_direct => {
            opora_agent::admin::handle_direct_message(deps, &msg.sender, &msg.text).await
        }
        InboundEvent::Message(msg) => {
            opora_agent::ingest::process_inbound_message(deps, msg).await
        }
        InboundEvent::Reaction(r) => opora_agent::reactions::handle_reaction(deps, r).await,
        InboundEvent::ContactRemoved { sender } => {
            opora_agent::admin::contact_removed(deps, &sender).await
        }
    };

    match result {
        Ok(()) => Ok(Json(json!({"ok": true}))),
        Err(e) => {
            warn!("event processing failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
