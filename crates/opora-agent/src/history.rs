use serde::Deserialize;
use tracing::{info, warn};

use opora_core::types::{Case, CaseId, CaseStatus, GroupId};
use opora_llm::LlmError;
use opora_store::cases::CaseDraft;

use crate::deps::Deps;
use crate::dispatch::HistoryLinkPayload;
use crate::error::{AgentError, Result};
use crate::promote::promote_case;

/// One extracted case block posted back by the history collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryCaseEntry {
    pub case_block: String,
    #[serde(default)]
    pub reaction_emoji: Option<String>,
}

/// HISTORY_LINK job: hand the freshly minted token to the collaborator so
/// it can begin its QR flow for this admin+group.
pub async fn run_history_link(deps: &Deps, payload: &HistoryLinkPayload) -> Result<()> {
    let Some(token) = deps.store.get_history_token(&payload.token)? else {
        // Token reaped or admin wiped since enqueue: job is moot.
        warn!(admin = %payload.admin_id, "history token gone, dropping link job");
        return Ok(());
    };
    if !token.is_usable(opora_core::now_ms()) {
        warn!(admin = %payload.admin_id, "history token expired before delivery");
        return Ok(());
    }

    let qr_hint = format!("opora:{}", payload.group_id);
    deps.history
        .deliver_link_token(&payload.token, &payload.group_id, &qr_hint)
        .await?;
    info!(admin = %payload.admin_id, group = %payload.group_id, "link token delivered");
    Ok(())
}

/// `/history/cases` ingestion: validate and consume the token, then parse,
/// structure, dedup and persist every posted case block. Returns the
/// number of cases inserted or merged.
pub async fn ingest_history_cases(
    deps: &Deps,
    token: &str,
    entries: Vec<HistoryCaseEntry>,
) -> Result<usize> {
    let Some(tok) = deps.store.get_history_token(token)? else {
        return Err(AgentError::TokenRejected("unknown token".to_string()));
    };
    if !tok.is_usable(opora_core::now_ms()) {
        return Err(AgentError::TokenRejected(
            "token consumed or expired".to_string(),
        ));
    }
    deps.store.consume_history_token(token)?;

    let group_id = tok.group_id.clone();
    let _guard = deps.locks.lock(&group_id).await;

    let mut imported = 0usize;
    for entry in entries {
        match import_case_block(deps, &group_id, &entry).await {
            Ok(true) => imported += 1,
            Ok(false) => {}
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => warn!(group = %group_id, "history case skipped: {e}"),
        }
    }

    crate::admin::finish_bootstrap(deps, &tok.admin_id, &group_id, imported).await?;
    Ok(imported)
}

async fn import_case_block(
    deps: &Deps,
    group_id: &GroupId,
    entry: &HistoryCaseEntry,
) -> Result<bool> {
    let evidence = parse_evidence_ids(&entry.case_block);

    let structure = match deps.llm.structure_case(&entry.case_block).await {
        Ok(s) => s,
        Err(LlmError::Parse(reason)) => {
            warn!(%reason, "history block unparseable, skipping");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    if !structure.keep {
        return Ok(false);
    }

    let draft = CaseDraft {
        problem_title: structure.problem_title.clone(),
        problem_summary: structure.problem_summary.clone(),
        solution_summary: structure.solution_summary.clone(),
        tags: structure.tags.clone(),
    };
    let dedup_text = format!("{}\n{}", draft.problem_title, draft.problem_summary);
    let embedding = deps.llm.embed(&dedup_text).await?;

    let confirmed = entry.reaction_emoji.is_some();
    let solved = confirmed
        || structure.status == opora_llm::types::ProposedStatus::Solved;

    let case_id = match deps.store.find_similar_case(
        group_id,
        &embedding,
        deps.config.cases.dedup_threshold,
        false,
        None,
    )? {
        Some(target) => {
            deps.store.merge_case(&target, &evidence, Some(&draft))?;
            target
        }
        None => {
            let now = opora_core::now_ms();
            let case = Case {
                case_id: CaseId::new(),
                group_id: group_id.clone(),
                status: if solved && !draft.solution_summary.trim().is_empty() {
                    CaseStatus::Solved
                } else {
                    CaseStatus::Open
                },
                problem_title: draft.problem_title,
                problem_summary: draft.problem_summary,
                solution_summary: draft.solution_summary,
                tags: draft.tags,
                evidence_ids: evidence,
                dedup_embedding: Some(embedding),
                in_index: false,
                closed_emoji: entry.reaction_emoji.clone(),
                created_at: now,
                updated_at: now,
            };
            deps.store.insert_case(&case)?;
            case.case_id
        }
    };

    if let Some(emoji) = &entry.reaction_emoji {
        deps.store.set_closed_emoji(&case_id, emoji)?;
        if let Some(case) = deps.store.get_case(&case_id)? {
            if case.status == CaseStatus::Open && !case.solution_summary.trim().is_empty() {
                deps.store
                    .update_case_to_solved(&case_id, &case.solution_summary)?;
            }
        }
    }
    if let Some(case) = deps.store.get_case(&case_id)? {
        promote_case(deps, &case).await?;
    }
    Ok(true)
}

/// Pull `msg_id=` header fields out of a case block. Works on any text the
/// collaborator sends as long as the buffer header fields survive.
fn parse_evidence_ids(case_block: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in case_block.lines() {
        for tok in line.split_whitespace() {
            if let Some(id) = tok.strip_prefix("msg_id=") {
                if !id.is_empty() && !out.contains(&id.to_string()) {
                    out.push(id.to_string());
                }
            }
        }
    }
    out
}
