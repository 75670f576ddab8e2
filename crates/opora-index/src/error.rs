use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Embedding dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, IndexError>;
