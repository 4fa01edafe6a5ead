use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid tool definition: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;
