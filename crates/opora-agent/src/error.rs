use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Store error: {0}")]
    Store(#[from] opora_store::StoreError),

    #[error("Index error: {0}")]
    Index(#[from] opora_index::IndexError),

    #[error("LLM error: {0}")]
    Llm(#[from] opora_llm::LlmError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] opora_buffer::BufferError),

    #[error("Queue error: {0}")]
    Queue(#[from] opora_queue::QueueError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::deps::TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt job payload: {0}")]
    CorruptPayload(String),

    #[error("History token rejected: {0}")]
    TokenRejected(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the worker should retry the job with backoff. Store and
    /// transport hiccups, LLM timeouts/5xx and cancellation are worth a
    /// retry; validation and payload errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Store(_) => true,
            AgentError::Index(_) => true,
            AgentError::Transport(_) => true,
            AgentError::Queue(_) => true,
            AgentError::Cancelled => true,
            AgentError::Llm(e) => e.is_transient(),
            AgentError::Buffer(_) => false,
            AgentError::Serialization(_) => false,
            AgentError::CorruptPayload(_) => false,
            AgentError::TokenRejected(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
