use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorStoreError>;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no index has been built yet")]
    IndexUnavailable,

    #[error("query vector has {query} dimensions, index has {index}")]
    DimensionMismatch { query: usize, index: usize },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("unsupported index schema version {0}")]
    SchemaVersion(u32),
}
