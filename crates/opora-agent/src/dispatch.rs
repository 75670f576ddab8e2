use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use opora_core::types::GroupId;
use opora_queue::{Job, JobFailure, JobHandler, JobType};

use crate::deps::Deps;
use crate::error::AgentError;
use crate::{answer, extractor, history};

/// Payload for BUFFER_UPDATE and MAYBE_RESPOND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJobPayload {
    pub group_id: GroupId,
    pub message_id: String,
}

/// Payload for HISTORY_LINK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryLinkPayload {
    pub admin_id: String,
    pub group_id: GroupId,
    pub token: String,
}

/// Routes leased jobs to the pipeline components and maps their errors to
/// the queue's retry semantics.
pub struct Dispatcher {
    deps: Arc<Deps>,
}

impl Dispatcher {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self { deps }
    }

    async fn run(&self, job: &Job, cancel: &CancellationToken) -> crate::error::Result<()> {
        match job.job_type {
            JobType::BufferUpdate => {
                let p: MessageJobPayload = parse_payload(job)?;
                extractor::run_buffer_update(&self.deps, &p.group_id, &p.message_id, cancel).await
            }
            JobType::MaybeRespond => {
                let p: MessageJobPayload = parse_payload(job)?;
                answer::run_maybe_respond(&self.deps, &p.group_id, &p.message_id).await
            }
            JobType::HistoryLink => {
                let p: HistoryLinkPayload = parse_payload(job)?;
                history::run_history_link(&self.deps, &p).await
            }
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(job: &Job) -> crate::error::Result<T> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| AgentError::CorruptPayload(format!("{} job: {e}", job.job_type)))
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), JobFailure> {
        debug!(job_id = %job.job_id, job_type = %job.job_type, "dispatching job");
        match self.run(job, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(JobFailure::transient(e.to_string())),
            Err(e) => Err(JobFailure::terminal(e.to_string())),
        }
    }
}
