use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use opora_core::config::OporaConfig;
use opora_core::types::GroupId;
use opora_index::CaseIndex;
use opora_llm::LlmGateway;
use opora_queue::JobQueue;
use opora_store::Store;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of the chat transport adapter.
///
/// Inbound events arrive over HTTP into the gateway; this trait covers the
/// calls the pipeline makes back out. Send methods return `Ok(false)` when
/// the adapter reports the recipient unreachable — for an admin recipient
/// that triggers contact-removed cleanup.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_group_text(
        &self,
        group_id: &GroupId,
        text: &str,
        quote_message_id: Option<&str>,
        mention_recipients: &[String],
    ) -> Result<bool, TransportError>;

    async fn send_direct_text(
        &self,
        admin_id: &str,
        text: &str,
        attachment_png: Option<&[u8]>,
    ) -> Result<bool, TransportError>;

    /// Groups the bot account can currently reach: (id, display name).
    async fn list_groups(&self) -> Result<Vec<(GroupId, String)>, TransportError>;
}

/// Outbound side of the history-bootstrap collaborator: hands over a fresh
/// link token so the collaborator can start its QR flow and later call back
/// with `/history/qr-ready` and `/history/cases`.
#[async_trait]
pub trait HistoryNotifier: Send + Sync {
    async fn deliver_link_token(
        &self,
        token: &str,
        group_id: &GroupId,
        qr_hint: &str,
    ) -> Result<(), TransportError>;
}

/// Per-group advisory locks serialising buffer and case mutation.
///
/// Single-node registry: one async mutex per group, created on first use.
/// The store itself only guarantees per-call atomicity, so every
/// read-modify-write sequence on a group holds this guard.
#[derive(Default)]
pub struct GroupLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, group_id: &GroupId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(group_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Everything the pipeline components need, passed through constructors —
/// no process-wide singletons. Config is read-only after load.
pub struct Deps {
    pub config: OporaConfig,
    pub store: Arc<Store>,
    pub index: Arc<CaseIndex>,
    pub llm: Arc<dyn LlmGateway>,
    pub transport: Arc<dyn Transport>,
    pub history: Arc<dyn HistoryNotifier>,
    pub queue: Arc<JobQueue>,
    pub locks: GroupLocks,
}

impl Deps {
    /// Case link shown in replies and the viewer.
    pub fn case_link(&self, case_id: &opora_core::types::CaseId) -> String {
        format!(
            "{}/cases/{}",
            self.config.server.public_base_url.trim_end_matches('/'),
            case_id
        )
    }
}
