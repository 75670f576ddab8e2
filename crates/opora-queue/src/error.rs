use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Corrupt job row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
