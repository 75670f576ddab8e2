use tracing::{debug, info, warn};

use opora_core::hash::sender_hash;
use opora_core::types::{GroupId, Lang, RawMessage};
use opora_llm::{ImageData, TAG_ADMIN};
use opora_store::InsertOutcome;

use crate::deps::Deps;
use crate::error::Result;

/// `MAYBE_RESPOND` entry point. Stateless: gate the message, retrieve the
/// three context layers, synthesize, substitute admin mentions, send as a
/// quoted reply — or stay silent, which is a correct outcome.
pub async fn run_maybe_respond(deps: &Deps, group_id: &GroupId, message_id: &str) -> Result<()> {
    let Some(msg) = deps.store.get_message(group_id, message_id)? else {
        return Ok(());
    };
    if msg.content_text.trim().is_empty() || msg.from_bot {
        return Ok(());
    }

    // Language and recipients come from the group's active admins; an
    // unadministered group gets no replies at all.
    let admins = deps.store.admins_for_group(group_id)?;
    if admins.is_empty() {
        debug!(group = %group_id, "no linked admins, staying silent");
        return Ok(());
    }
    let lang = group_language(deps, &admins)?;

    // Privileged commands short-circuit the pipeline.
    if let Some(handled) = handle_command(deps, group_id, &msg, &admins).await? {
        if handled {
            return Ok(());
        }
    }

    // Gate.
    let mentioned = is_bot_mention(&deps.config.transport.bot_mentions, &msg.content_text);
    if !mentioned {
        let recent = recent_context(deps, group_id, &msg)?;
        let images = gate_images(deps, &msg);
        let decision = deps
            .llm
            .gate_classify(&msg.content_text, &recent, &images)
            .await?;
        if !decision.consider {
            debug!(group = %group_id, message_id, tag = ?decision.tag, "gated out");
            return Ok(());
        }
    }

    // Three retrieval layers: semantic index, recently solved, open.
    let query_embedding = deps.llm.embed(&msg.content_text).await?;
    let hits = deps.index.query(
        group_id,
        &query_embedding,
        deps.config.answer.retrieve_top_k,
    )?;
    let since = opora_core::now_ms() - deps.config.answer.recent_solved_window_ms;
    let recent_solved = deps.store.get_recent_solved_cases(group_id, since)?;
    let open_cases = deps.store.get_open_cases_for_group(group_id)?;

    let reply = if !hits.is_empty() || !recent_solved.is_empty() {
        let mut context = String::from("Solved cases:\n");
        let mut seen: Vec<String> = Vec::new();
        for hit in &hits {
            seen.push(hit.case_id.as_str().to_string());
            context.push_str(&format!(
                "{}\nLink: {}\n\n",
                hit.document,
                deps.case_link(&hit.case_id)
            ));
        }
        for case in &recent_solved {
            if seen.contains(&case.case_id.as_str().to_string()) {
                continue;
            }
            context.push_str(&format!(
                "{}\nLink: {}\n\n",
                case.index_document(),
                deps.case_link(&case.case_id)
            ));
        }
        deps.llm
            .synthesize_answer(&msg.content_text, &context, lang)
            .await?
    } else if !open_cases.is_empty() {
        let mut context = String::from(
            "No solved cases. These open cases are already being tracked:\n",
        );
        for case in &open_cases {
            context.push_str(&format!(
                "[OPEN] {}\nProblem: {}\nLink: {}\n\n",
                case.problem_title,
                case.problem_summary,
                deps.case_link(&case.case_id)
            ));
        }
        let mut reply = deps
            .llm
            .synthesize_answer(&msg.content_text, &context, lang)
            .await?;
        // The open-context contract: admins are always brought in.
        if !reply.contains(TAG_ADMIN) {
            reply.push(' ');
            reply.push_str(TAG_ADMIN);
        }
        reply
    } else {
        // Nothing retrieved: skip the synthesizer entirely.
        String::from(TAG_ADMIN)
    };

    send_reply(deps, group_id, message_id, &reply, &admins).await
}

/// Resolve the reply language from the first linked admin with a session.
fn group_language(deps: &Deps, admins: &[String]) -> Result<Lang> {
    for admin in admins {
        if let Some(session) = deps.store.get_admin_session(admin)? {
            return Ok(session.lang);
        }
    }
    Ok(deps
        .config
        .admin
        .language_default
        .parse()
        .unwrap_or_default())
}

/// Whitelisted prefix commands from group admins. Returns `Some(true)` when
/// a command was recognised and applied.
async fn handle_command(
    deps: &Deps,
    group_id: &GroupId,
    msg: &RawMessage,
    admins: &[String],
) -> Result<Option<bool>> {
    let text = msg.content_text.trim();
    let Some(rest) = text.strip_prefix("/setdocs") else {
        return Ok(None);
    };
    let is_admin = admins
        .iter()
        .any(|a| sender_hash(a) == msg.sender_hash);
    if !is_admin {
        debug!(group = %group_id, "ignoring /setdocs from non-admin");
        return Ok(Some(true));
    }
    let urls: Vec<String> = rest
        .split_whitespace()
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .map(String::from)
        .collect();
    deps.store.set_group_docs(group_id, &urls)?;
    info!(group = %group_id, count = urls.len(), "group docs updated");
    Ok(Some(true))
}

fn is_bot_mention(mentions: &[String], text: &str) -> bool {
    mentions.iter().any(|m| !m.is_empty() && text.contains(m.as_str()))
}

/// The last K messages before the current one, one line each.
fn recent_context(deps: &Deps, group_id: &GroupId, msg: &RawMessage) -> Result<String> {
    let recent = deps.store.get_recent_messages(
        group_id,
        msg.ts,
        deps.config.answer.recent_context_k,
    )?;
    let mut out = String::new();
    for m in recent {
        let who = m.sender_name.as_deref().unwrap_or(&m.sender_hash);
        out.push_str(&format!("{}: {}\n", who, m.content_text));
    }
    Ok(out)
}

/// Up to two of the message's images for the gate call. Unreadable files
/// are skipped; the gate then classifies on text alone.
fn gate_images(deps: &Deps, msg: &RawMessage) -> Vec<ImageData> {
    let root = &deps.config.images.root;
    msg.image_paths
        .iter()
        .take(2)
        .filter_map(|rel| {
            let path = std::path::Path::new(root).join(rel);
            let bytes = std::fs::read(&path).ok()?;
            if bytes.len() as u64 > deps.config.images.max_bytes {
                return None;
            }
            let mime = match path.extension().and_then(|e| e.to_str()) {
                Some("png") => "image/png",
                Some("webp") => "image/webp",
                _ => "image/jpeg",
            };
            Some(ImageData {
                bytes,
                mime: mime.to_string(),
            })
        })
        .collect()
}

/// Substitute the admin sentinel, claim the reply key, send. A duplicate
/// claim means an earlier delivery already answered this message.
async fn send_reply(
    deps: &Deps,
    group_id: &GroupId,
    message_id: &str,
    reply: &str,
    admins: &[String],
) -> Result<()> {
    let (text, mentions) = substitute_admin_tag(reply, admins);
    if text.trim().is_empty() {
        return Ok(());
    }

    if deps.store.claim_reply(group_id, message_id)? == InsertOutcome::Duplicate {
        debug!(group = %group_id, message_id, "reply already sent, skipping");
        return Ok(());
    }

    let ok = match deps
        .transport
        .send_group_text(group_id, &text, Some(message_id), &mentions)
        .await
    {
        Ok(ok) => ok,
        Err(e) => {
            // Transient transport failure: free the claim so the worker's
            // retry can claim and send for real.
            deps.store.release_reply(group_id, message_id)?;
            return Err(e.into());
        }
    };
    if !ok {
        deps.store.release_reply(group_id, message_id)?;
        warn!(group = %group_id, message_id, "transport rejected reply");
        // A rejected send that tagged admins means those recipients are
        // unreachable: tear their contact state down.
        for admin_id in &mentions {
            crate::admin::contact_removed(deps, admin_id).await?;
        }
        return Err(crate::deps::TransportError::Unavailable(
            "group send rejected".to_string(),
        )
        .into());
    }
    info!(group = %group_id, message_id, mentions = mentions.len(), "reply sent");
    Ok(())
}

/// Replace `[[TAG_ADMIN]]` with transport mention tokens and return the
/// recipients that must be resolved by the adapter.
pub fn substitute_admin_tag(reply: &str, admins: &[String]) -> (String, Vec<String>) {
    if !reply.contains(TAG_ADMIN) {
        return (reply.to_string(), Vec::new());
    }
    let tokens = admins
        .iter()
        .map(|a| format!("@{a}"))
        .collect::<Vec<_>>()
        .join(" ");
    (
        reply.replace(TAG_ADMIN, &tokens).trim().to_string(),
        admins.to_vec(),
    )
}
