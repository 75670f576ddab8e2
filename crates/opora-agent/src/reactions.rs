use tracing::{debug, info};

use opora_core::event::InboundReaction;
use opora_core::hash::sender_hash;

use crate::deps::Deps;
use crate::error::Result;
use crate::promote::promote_case;

/// Apply one reaction event. A positive emoji on a message that is
/// evidence of open cases confirms them solved; removal only deletes the
/// reaction tuple and never un-solves anything.
pub async fn handle_reaction(deps: &Deps, r: InboundReaction) -> Result<()> {
    let hash = sender_hash(&r.sender);
    let author_hash = sender_hash(&r.target_author);

    if r.is_remove {
        deps.store.delete_reaction(
            &r.group_id,
            r.target_ts,
            &author_hash,
            &hash,
            &r.emoji,
        )?;
        debug!(group = %r.group_id, ts = r.target_ts, "reaction removed");
        return Ok(());
    }

    let is_positive = deps
        .config
        .cases
        .positive_emojis
        .iter()
        .any(|e| e == &r.emoji);
    deps.store.upsert_reaction(
        &r.group_id,
        r.target_ts,
        &author_hash,
        &hash,
        &r.emoji,
        is_positive,
    )?;
    if !is_positive {
        return Ok(());
    }

    let _guard = deps.locks.lock(&r.group_id).await;
    let solved = deps
        .store
        .confirm_cases_by_evidence_ts(&r.group_id, r.target_ts, &r.emoji)?;
    if solved.is_empty() {
        return Ok(());
    }
    info!(group = %r.group_id, count = solved.len(), emoji = %r.emoji, "cases confirmed by reaction");

    // Cases that already carry a solution go straight to the index; the
    // rest wait for a resolution check to fill the solution in.
    for case_id in solved {
        if let Some(case) = deps.store.get_case(&case_id)? {
            promote_case(deps, &case).await?;
        }
    }
    Ok(())
}
