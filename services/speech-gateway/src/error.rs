//! Service-specific error types
//!
//! Request validation failures are answered directly by the handler; these
//! are the failures that happen after a request was accepted.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The queue gave up on the provider call
    #[error(transparent)]
    Upstream(#[from] request_queue::Error),

    /// The provider answered with audio we cannot package
    #[error("unsupported audio format: {0}")]
    UnsupportedAudio(String),

    /// Generated audio could not be persisted
    #[error("storing audio failed: {0}")]
    Storage(#[from] artifact_cache::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use request_queue::{AttemptError, FailureKind};

    #[test]
    fn error_display_messages_are_descriptive() {
        let upstream = Error::from(request_queue::Error {
            label: "tts".into(),
            attempts: 4,
            source: AttemptError::new(FailureKind::Status(503), None, "overloaded"),
        });
        assert_eq!(
            upstream.to_string(),
            "tts failed after 4 attempt(s): upstream status 503: overloaded"
        );
        assert_eq!(
            Error::UnsupportedAudio("audio/mpeg".into()).to_string(),
            "unsupported audio format: audio/mpeg"
        );
        assert!(
            Error::from(artifact_cache::Error::Storage("bucket down".into()))
                .to_string()
                .contains("bucket down")
        );
    }
}
