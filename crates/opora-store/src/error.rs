use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Case not found: {id}")]
    CaseNotFound { id: String },

    #[error("Message not found: {group_id}/{message_id}")]
    MessageNotFound { group_id: String, message_id: String },

    #[error("History token not found: {token}")]
    TokenNotFound { token: String },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
