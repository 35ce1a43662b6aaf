use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vector store error: {0}")]
    VectorStore(#[from] brain_vector_store::VectorStoreError),

    #[error("invalid root path: {0}")]
    InvalidRoot(String),

    #[error("ignore pattern error: {0}")]
    Pattern(#[from] globset::Error),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error("{0}")]
    Other(String),
}
