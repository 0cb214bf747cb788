//! Error types for key pool construction

/// Errors from key pool operations.
///
/// Selection itself never fails; the only error is a pool with nothing in it,
/// which is a configuration problem surfaced at startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoCredentials,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
