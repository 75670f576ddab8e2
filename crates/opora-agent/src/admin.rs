use tracing::{info, warn};

use opora_core::types::{AdminSession, AdminState, GroupId, Lang};
use opora_queue::JobType;

use crate::deps::Deps;
use crate::dispatch::HistoryLinkPayload;
use crate::error::Result;
use crate::strings;

/// Characters that only occur in Ukrainian among the languages we care
/// about; their presence picks the Ukrainian interface.
const UKRAINIAN_MARKERS: &[char] = &['і', 'ї', 'є', 'ґ', 'І', 'Ї', 'Є', 'Ґ'];

pub fn detect_language(text: &str) -> Lang {
    if text.chars().any(|c| UKRAINIAN_MARKERS.contains(&c)) {
        Lang::Uk
    } else {
        Lang::En
    }
}

/// Handle one direct message from an admin. Drives the onboarding state
/// machine: None -> awaiting_group_name -> awaiting_qr_scan -> None.
pub async fn handle_direct_message(deps: &Deps, admin_id: &str, text: &str) -> Result<()> {
    let trimmed = text.trim();

    // Language override and wipe work in any state.
    if let Some(lang) = match trimmed {
        "/uk" => Some(Lang::Uk),
        "/en" => Some(Lang::En),
        _ => None,
    } {
        let mut session = deps
            .store
            .get_admin_session(admin_id)?
            .unwrap_or_else(|| fresh_session(admin_id, lang));
        session.lang = lang;
        session.updated_at = opora_core::now_ms();
        deps.store.put_admin_session(&session)?;
        send_dm(deps, admin_id, strings::lang_set(lang)).await?;
        return Ok(());
    }

    if trimmed == "/wipe" {
        let lang = session_lang(deps, admin_id)?;
        wipe_admin(deps, admin_id, true).await?;
        send_dm(deps, admin_id, strings::wiped(lang)).await?;
        return Ok(());
    }

    match deps.store.get_admin_session(admin_id)? {
        None => {
            // First contact: detect language from this very message.
            let lang = detect_language(trimmed);
            let session = fresh_session(admin_id, lang);
            deps.store.put_admin_session(&session)?;
            send_dm(deps, admin_id, strings::welcome(lang)).await?;
        }
        Some(mut session) => {
            // In both active states a group name starts (or restarts) the
            // bootstrap; a restart first cancels the pending link job.
            if session.state == AdminState::AwaitingQrScan {
                let cancelled = deps
                    .queue
                    .cancel_by_key(JobType::HistoryLink, admin_id)?;
                if cancelled > 0 {
                    info!(admin = %admin_id, cancelled, "restarting group search, prior link cancelled");
                }
            }
            begin_group_bootstrap(deps, &mut session, trimmed).await?;
        }
    }
    Ok(())
}

/// Look the named group up among the transport's reachable groups and, on a
/// match, mint a token and enqueue the HISTORY_LINK job.
async fn begin_group_bootstrap(
    deps: &Deps,
    session: &mut AdminSession,
    group_name: &str,
) -> Result<()> {
    let groups = deps.transport.list_groups().await?;
    let found = groups
        .iter()
        .find(|(_, name)| name.trim().eq_ignore_ascii_case(group_name));

    let Some((group_id, name)) = found else {
        send_dm(deps, &session.admin_id.clone(), strings::group_not_found(session.lang)).await?;
        return Ok(());
    };

    let token = deps.store.create_history_token(
        &session.admin_id,
        group_id,
        deps.config.history.token_ttl_ms,
    )?;

    let payload = serde_json::to_value(HistoryLinkPayload {
        admin_id: session.admin_id.clone(),
        group_id: group_id.clone(),
        token: token.token.clone(),
    })?;
    deps.queue
        .enqueue(JobType::HistoryLink, payload, Some(&session.admin_id))?;

    session.state = AdminState::AwaitingQrScan;
    session.pending_group_id = Some(group_id.clone());
    session.pending_group_name = Some(name.clone());
    session.pending_token = Some(token.token);
    session.updated_at = opora_core::now_ms();
    deps.store.put_admin_session(session)?;

    info!(admin = %session.admin_id, group = %group_id, "history bootstrap started");
    send_dm(deps, &session.admin_id.clone(), strings::qr_pending(session.lang)).await?;
    Ok(())
}

/// External event: the transport reports the admin contact gone. Tears
/// down the session, its pending jobs and tokens, and the group links.
pub async fn contact_removed(deps: &Deps, admin_id: &str) -> Result<()> {
    wipe_admin(deps, admin_id, false).await
}

/// Shared teardown. `purge_orphaned_groups` additionally wipes the data of
/// groups left without any admin (the /wipe semantics).
async fn wipe_admin(deps: &Deps, admin_id: &str, purge_orphaned_groups: bool) -> Result<()> {
    deps.queue.cancel_by_key(JobType::HistoryLink, admin_id)?;
    let orphaned = deps.store.wipe_admin(admin_id)?;
    if purge_orphaned_groups {
        for group in orphaned {
            deps.store.delete_group_data(&group)?;
            info!(admin = %admin_id, group = %group, "orphaned group purged");
        }
    }
    Ok(())
}

/// DM an admin; an unreachable recipient escalates to contact-removed.
async fn send_dm(deps: &Deps, admin_id: &str, text: &str) -> Result<()> {
    match deps.transport.send_direct_text(admin_id, text, None).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(admin = %admin_id, "admin unreachable, removing contact");
            contact_removed(deps, admin_id).await
        }
        Err(e) => Err(e.into()),
    }
}

/// DM the QR image once the collaborator reports it ready.
pub async fn deliver_qr(deps: &Deps, admin_id: &str, qr_png: &[u8]) -> Result<()> {
    let lang = session_lang(deps, admin_id)?;
    match deps
        .transport
        .send_direct_text(admin_id, strings::qr_ready(lang), Some(qr_png))
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => contact_removed(deps, admin_id).await,
        Err(e) => Err(e.into()),
    }
}

/// Close out a finished bootstrap: link the admin to the group and reset
/// the session state.
pub async fn finish_bootstrap(
    deps: &Deps,
    admin_id: &str,
    group_id: &GroupId,
    imported: usize,
) -> Result<()> {
    deps.store.link_admin_group(admin_id, group_id)?;
    if let Some(mut session) = deps.store.get_admin_session(admin_id)? {
        session.state = AdminState::AwaitingGroupName;
        session.pending_group_id = None;
        session.pending_group_name = None;
        session.pending_token = None;
        session.updated_at = opora_core::now_ms();
        deps.store.put_admin_session(&session)?;
        send_dm(deps, admin_id, &strings::bootstrap_done(session.lang, imported)).await?;
    }
    info!(admin = %admin_id, group = %group_id, imported, "history bootstrap finished");
    Ok(())
}

fn session_lang(deps: &Deps, admin_id: &str) -> Result<Lang> {
    Ok(deps
        .store
        .get_admin_session(admin_id)?
        .map(|s| s.lang)
        .unwrap_or_else(|| {
            deps.config
                .admin
                .language_default
                .parse()
                .unwrap_or_default()
        }))
}

fn fresh_session(admin_id: &str, lang: Lang) -> AdminSession {
    AdminSession {
        admin_id: admin_id.to_string(),
        state: AdminState::AwaitingGroupName,
        pending_group_id: None,
        pending_group_name: None,
        pending_token: None,
        lang,
        updated_at: opora_core::now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ukrainian_markers_pick_uk() {
        assert_eq!(detect_language("Привіт, боте!"), Lang::Uk);
        assert_eq!(detect_language("Це моя група"), Lang::Uk);
    }

    #[test]
    fn latin_and_plain_cyrillic_pick_en() {
        assert_eq!(detect_language("Hello bot"), Lang::En);
        // Russian-only Cyrillic has none of the marker characters.
        assert_eq!(detect_language("Привет"), Lang::En);
    }
}
