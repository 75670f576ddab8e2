use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};

use opora_core::event::InboundMessage;
use opora_core::hash::sender_hash;
use opora_core::types::RawMessage;
use opora_llm::ImageData;
use opora_queue::JobType;
use opora_store::InsertOutcome;

use crate::deps::Deps;
use crate::dispatch::MessageJobPayload;
use crate::error::Result;

/// Ingest one inbound group message: OCR attached images, persist the raw
/// message idempotently, enqueue `BUFFER_UPDATE` and `MAYBE_RESPOND`.
///
/// A redelivered message (duplicate key) enqueues nothing — its jobs
/// already ran or are queued.
pub async fn process_inbound_message(deps: &Deps, msg: InboundMessage) -> Result<()> {
    let hash = sender_hash(&msg.sender);
    let from_bot = hash == deps.config.transport.bot_sender_hash;

    let mut content = msg.text.clone();
    let image_paths: Vec<String> = msg
        .image_paths
        .iter()
        .take(deps.config.images.max_per_message)
        .cloned()
        .collect();

    for rel in &image_paths {
        match load_image(&deps.config.images.root, rel, deps.config.images.max_bytes) {
            Some(image) => match deps.llm.image_to_text(&image, &msg.text).await {
                Ok(facts) => {
                    let payload = json!({
                        "observations": facts.observations,
                        "extracted_text": facts.extracted_text,
                    });
                    content.push_str(&format!("\n\n[image]\n{}", payload));
                }
                Err(e) => {
                    warn!(path = %rel, "image description failed: {e}");
                    content.push_str(&format!("\n\n[image: {}]", filename(rel)));
                }
            },
            None => {
                content.push_str(&format!("\n\n[image: {}]", filename(rel)));
            }
        }
    }

    let record = RawMessage {
        group_id: msg.group_id.clone(),
        message_id: msg.message_id.clone(),
        ts: msg.ts,
        sender_hash: hash,
        sender_name: msg.sender_name.clone(),
        content_text: content,
        image_paths,
        reply_to_id: msg.reply_to_id.clone(),
        reaction_count: 0,
        from_bot,
    };

    if deps.store.insert_raw_message(&record)? == InsertOutcome::Duplicate {
        debug!(group = %msg.group_id, message_id = %msg.message_id, "duplicate message, skipping");
        return Ok(());
    }

    let payload = serde_json::to_value(MessageJobPayload {
        group_id: msg.group_id.clone(),
        message_id: msg.message_id.clone(),
    })?;

    deps.queue
        .enqueue(JobType::BufferUpdate, payload.clone(), Some(msg.group_id.as_str()))?;

    // Backpressure: buffer updates are mandatory, answering is not. Above
    // the high watermark the reply job is deferred entirely.
    let depth = deps.queue.depth()?;
    if depth <= deps.config.queue.high_watermark {
        deps.queue
            .enqueue(JobType::MaybeRespond, payload, Some(msg.group_id.as_str()))?;
    } else {
        info!(depth, group = %msg.group_id, "queue above high watermark, deferring reply job");
    }

    Ok(())
}

/// Read an attached image from under the configured root, enforcing the
/// size cap. Returns `None` (non-fatal) for missing or oversized files.
fn load_image(root: &str, rel: &str, max_bytes: u64) -> Option<ImageData> {
    let path = safe_join(root, rel)?;
    let meta = std::fs::metadata(&path).ok()?;
    if meta.len() > max_bytes {
        warn!(path = %rel, size = meta.len(), "image exceeds size cap, skipping description");
        return None;
    }
    let bytes = std::fs::read(&path).ok()?;
    Some(ImageData {
        mime: mime_for(&path),
        bytes,
    })
}

/// Join a relative image path under the root, refusing traversal.
fn safe_join(root: &str, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        warn!(path = %rel, "rejecting image path outside the images root");
        return None;
    }
    Some(Path::new(root).join(rel_path))
}

fn mime_for(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
    .to_string()
}

fn filename(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_traversal() {
        assert!(safe_join("/data/images", "../etc/passwd").is_none());
        assert!(safe_join("/data/images", "/etc/passwd").is_none());
        assert!(safe_join("/data/images", "g1/photo.jpg").is_some());
    }

    #[test]
    fn mime_guessed_from_extension() {
        assert_eq!(mime_for(Path::new("a/b.png")), "image/png");
        assert_eq!(mime_for(Path::new("a/b.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn filename_strips_directories() {
        assert_eq!(filename("g1/2024/photo.jpg"), "photo.jpg");
        assert_eq!(filename("photo.jpg"), "photo.jpg");
    }
}
