use tracing::warn;

use opora_core::types::Case;
use opora_index::IndexMetadata;

use crate::deps::Deps;
use crate::error::Result;

/// Upsert a solved case into the semantic index and flag it `in_index`.
///
/// Only solved cases with a non-empty solution are ever promoted; callers
/// check that, this function re-checks and refuses otherwise. An index
/// upsert failure is logged and swallowed: the store flag is set anyway
/// and the reconciler re-upserts on its next tick.
pub async fn promote_case(deps: &Deps, case: &Case) -> Result<bool> {
    if case.status != opora_core::types::CaseStatus::Solved
        || case.solution_summary.trim().is_empty()
    {
        return Ok(false);
    }

    let document = case.index_document();
    let embedding = deps.llm.embed(&document).await?;

    let evidence_image_paths = evidence_image_paths(deps, case)?;
    let metadata = IndexMetadata {
        group_id: case.group_id.clone(),
        status: case.status.to_string(),
        evidence_ids: case.evidence_ids.clone(),
        evidence_image_paths,
    };

    if let Err(e) = deps
        .index
        .upsert_case(&case.case_id, &document, &embedding, &metadata)
    {
        warn!(case_id = %case.case_id, "index upsert failed, reconciler will retry: {e}");
    }
    deps.store.mark_case_in_index(&case.case_id)?;
    Ok(true)
}

fn evidence_image_paths(deps: &Deps, case: &Case) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for mid in &case.evidence_ids {
        if let Some(m) = deps.store.get_message(&case.group_id, mid)? {
            paths.extend(m.image_paths);
        }
    }
    Ok(paths)
}
