use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::deps::Deps;
use crate::error::Result;

/// How often the periodic pass runs.
const TICK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Periodic maintenance: expire stale open cases, reconcile the index
/// against the store in both directions, and garbage-collect tokens and
/// finished jobs.
///
/// Per-operation compensation logic stays out of the hot path because this
/// pass re-establishes the invariants within one tick; answer lookup
/// tolerates a stale index in the meantime.
pub struct Reconciler {
    deps: Arc<Deps>,
}

impl Reconciler {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self { deps }
    }

    /// Tick loop; runs once immediately, then hourly until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("reconciler started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("reconciler tick failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass. Public so tests can drive it without the timer.
    pub async fn tick(&self) -> Result<()> {
        self.expire_open_cases()?;
        self.reconcile_index().await?;
        self.collect_garbage()?;
        Ok(())
    }

    fn expire_open_cases(&self) -> Result<()> {
        let ttl_ms = self.deps.config.cases.open_ttl_days * 24 * 60 * 60 * 1000;
        let cutoff = opora_core::now_ms() - ttl_ms;
        let n = self.deps.store.expire_old_open_cases(cutoff)?;
        if n > 0 {
            info!(count = n, "stale open cases expired");
        }
        Ok(())
    }

    /// Two-way index repair: entries without a live `in_index` store row are
    /// deleted; store rows flagged `in_index` but missing from the index are
    /// re-embedded and re-upserted.
    async fn reconcile_index(&self) -> Result<()> {
        let deps = &self.deps;

        let indexed: Vec<_> = deps.index.list_ids(None)?;
        let mut present: HashSet<String> = HashSet::new();
        let mut orphans = 0usize;
        for case_id in indexed {
            let keep = deps
                .store
                .get_case(&case_id)?
                .map(|c| c.in_index)
                .unwrap_or(false);
            if keep {
                present.insert(case_id.as_str().to_string());
            } else {
                deps.index.delete_case(&case_id)?;
                orphans += 1;
            }
        }

        let mut healed = 0usize;
        for case in deps.store.cases_marked_in_index()? {
            if present.contains(case.case_id.as_str()) {
                continue;
            }
            if case.solution_summary.trim().is_empty() {
                // Flag out of sync with content (e.g. confirmed by reaction
                // before a solution existed): leave unindexed rather than
                // index a case with no solution.
                warn!(case_id = %case.case_id, "in_index case without solution, not re-upserting");
                continue;
            }
            match crate::promote::promote_case(deps, &case).await {
                Ok(true) => healed += 1,
                Ok(false) => {}
                Err(e) => warn!(case_id = %case.case_id, "re-upsert failed: {e}"),
            }
        }

        if orphans > 0 || healed > 0 {
            info!(orphans, healed, "index reconciled");
        }
        Ok(())
    }

    fn collect_garbage(&self) -> Result<()> {
        let tokens = self.deps.store.reap_history_tokens(opora_core::now_ms())?;
        let jobs = self
            .deps
            .queue
            .gc_finished(self.deps.config.queue.retention_ms)?;
        if tokens > 0 || jobs > 0 {
            info!(tokens, jobs, "garbage collected");
        }
        Ok(())
    }
}
