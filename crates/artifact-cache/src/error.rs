//! Error types for artifact storage and metadata operations

/// Errors from the object store or metadata index.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store error: {0}")]
    Storage(String),

    #[error("metadata index error: {0}")]
    Index(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("metadata parse error: {0}")]
    Parse(String),
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
