use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opora_buffer as buffer;
use opora_core::types::{Case, CaseId, CaseStatus, GroupId};
use opora_llm::types::{ProposedStatus, SpanRange};
use opora_llm::LlmError;
use opora_store::cases::CaseDraft;

use crate::deps::Deps;
use crate::error::{AgentError, Result};
use crate::promote::promote_case;

/// `BUFFER_UPDATE` entry point: append the message to the group buffer,
/// trim, extract new case spans (phase 1), dynamically resolve open cases
/// (phase 2), and shrink the buffer by the accepted spans.
///
/// Holds the group's advisory lock for the whole run; everything here is
/// idempotent under at-least-once redelivery.
pub async fn run_buffer_update(
    deps: &Deps,
    group_id: &GroupId,
    message_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let _guard = deps.locks.lock(group_id).await;

    let Some(mut msg) = deps.store.get_message(group_id, message_id)? else {
        // Message gone (group wiped between enqueue and run): nothing to do.
        debug!(group = %group_id, message_id, "message absent, skipping buffer update");
        return Ok(());
    };
    msg.reaction_count = deps.store.count_positive_reactions(group_id, msg.ts)?;

    // Append unless a previous (re-delivered) run already got it into the
    // buffer — or already extracted it into a case.
    let mut text = deps.store.get_buffer(group_id)?;
    let already_present = buffer::parse_to_blocks(&text)
        .iter()
        .any(|b| b.message_id == msg.message_id)
        || deps
            .store
            .message_is_case_evidence(group_id, &msg.message_id)?;
    if !already_present {
        text = buffer::append(&text, &msg);
    }

    let blocks = buffer::trim_blocks(
        buffer::parse_to_blocks(&text),
        opora_core::now_ms(),
        deps.config.buffer.max_age_hours,
        deps.config.buffer.max_messages,
    );
    let text = buffer::rebuild(&blocks);
    deps.store.set_buffer(group_id, &text)?;

    // Phase 1 — new cases from the current buffer.
    let mut accepted: Vec<SpanRange> = Vec::new();
    let spans = extract_spans(deps, &blocks).await?;
    for span in spans {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if process_span(deps, group_id, &blocks, span).await? {
            accepted.push(span);
        }
    }

    // Phase 2 — dynamic resolution of open cases against the buffer.
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    resolve_open_cases(deps, group_id, &text).await?;

    // Shrink the buffer by exactly the accepted spans.
    if !accepted.is_empty() {
        let new_text = buffer::remove_spans(&blocks, &accepted)?;
        deps.store.set_buffer(group_id, &new_text)?;
        info!(
            group = %group_id,
            spans = accepted.len(),
            "buffer shrunk by accepted case spans"
        );
    }

    Ok(())
}

/// Span extraction with local failure handling: an invalid or unparseable
/// result degrades to "no spans" (logged), transport-level failures bubble
/// up for the worker's retry.
async fn extract_spans(deps: &Deps, blocks: &[buffer::Block]) -> Result<Vec<SpanRange>> {
    if blocks.iter().all(|b| b.from_bot) {
        return Ok(Vec::new());
    }
    let numbered = buffer::format_numbered(blocks);
    match deps.llm.extract_case_spans(&numbered, blocks.len()).await {
        Ok(spans) => Ok(spans),
        Err(LlmError::InvalidSpans(reason)) => {
            warn!(%reason, "span extraction rejected, keeping buffer intact");
            Ok(Vec::new())
        }
        Err(LlmError::Parse(reason)) => {
            warn!(%reason, "span extraction unparseable, treating as no spans");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Structure, dedup and persist one span. Returns whether the span is
/// accepted for removal (i.e. it ended in a solved, indexed case).
async fn process_span(
    deps: &Deps,
    group_id: &GroupId,
    blocks: &[buffer::Block],
    span: SpanRange,
) -> Result<bool> {
    let case_text = buffer::span_text(blocks, span);
    let structure = match deps.llm.structure_case(&case_text).await {
        Ok(s) => s,
        Err(LlmError::Parse(reason)) => {
            warn!(%reason, "case structuring unparseable, skipping span");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    if !structure.keep {
        debug!(group = %group_id, "span discarded by structuring");
        return Ok(false);
    }

    let evidence = buffer::span_evidence_ids(blocks, span);
    let draft = CaseDraft {
        problem_title: structure.problem_title.clone(),
        problem_summary: structure.problem_summary.clone(),
        solution_summary: structure.solution_summary.clone(),
        tags: structure.tags.clone(),
    };

    let dedup_text = format!("{}\n{}", draft.problem_title, draft.problem_summary);
    let dedup_embedding = deps.llm.embed(&dedup_text).await?;

    let case = match deps.store.find_similar_case(
        group_id,
        &dedup_embedding,
        deps.config.cases.dedup_threshold,
        false,
        None,
    )? {
        Some(target) => {
            info!(group = %group_id, case_id = %target, "span merged into existing case");
            let merged = deps.store.merge_case(&target, &evidence, Some(&draft))?;
            if structure.status == ProposedStatus::Solved && merged.status == CaseStatus::Open {
                deps.store
                    .update_case_to_solved(&merged.case_id, &merged.solution_summary)?;
            }
            deps.store
                .get_case(&merged.case_id)?
                .unwrap_or(merged)
        }
        None => {
            let now = opora_core::now_ms();
            let case = Case {
                case_id: CaseId::new(),
                group_id: group_id.clone(),
                status: match structure.status {
                    ProposedStatus::Open => CaseStatus::Open,
                    ProposedStatus::Solved => CaseStatus::Solved,
                },
                problem_title: draft.problem_title,
                problem_summary: draft.problem_summary,
                solution_summary: draft.solution_summary,
                tags: draft.tags,
                evidence_ids: evidence,
                dedup_embedding: Some(dedup_embedding),
                in_index: false,
                closed_emoji: None,
                created_at: now,
                updated_at: now,
            };
            deps.store.insert_case(&case)?;
            info!(group = %group_id, case_id = %case.case_id, status = %case.status, "case created");
            case
        }
    };

    // A span leaves the buffer only once its case is solved and indexed;
    // open cases keep their messages around for dynamic resolution.
    promote_case(deps, &case).await
}

/// Phase 2: ask, for every open case, whether the buffer now contains its
/// resolution. A resolved case either merges into a solved near-duplicate
/// or is promoted itself.
async fn resolve_open_cases(deps: &Deps, group_id: &GroupId, buffer_text: &str) -> Result<()> {
    for case in deps.store.get_open_cases_for_group(group_id)? {
        let check = match deps
            .llm
            .check_resolved(&case.problem_title, &case.problem_summary, buffer_text)
            .await
        {
            Ok(c) => c,
            Err(LlmError::Parse(reason)) => {
                warn!(case_id = %case.case_id, %reason, "resolution check unparseable, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !check.resolved {
            continue;
        }

        let solved_peer = match &case.dedup_embedding {
            Some(emb) => deps.store.find_similar_case(
                group_id,
                emb,
                deps.config.cases.dedup_threshold,
                true,
                Some(&case.case_id),
            )?,
            None => None,
        };

        match solved_peer {
            Some(peer) => {
                // The fix already lives in a solved case: fold this one in.
                let draft = CaseDraft {
                    problem_title: case.problem_title.clone(),
                    problem_summary: case.problem_summary.clone(),
                    solution_summary: check.solution_summary.clone(),
                    tags: case.tags.clone(),
                };
                let merged = deps
                    .store
                    .merge_case(&peer, &case.evidence_ids, Some(&draft))?;
                deps.store.archive_case(&case.case_id)?;
                promote_case(deps, &merged).await?;
                info!(case_id = %case.case_id, peer = %peer, "open case merged into solved peer");
            }
            None => {
                deps.store
                    .update_case_to_solved(&case.case_id, &check.solution_summary)?;
                if let Some(solved) = deps.store.get_case(&case.case_id)? {
                    promote_case(deps, &solved).await?;
                }
                info!(case_id = %case.case_id, "open case resolved dynamically");
            }
        }
    }
    Ok(())
}
