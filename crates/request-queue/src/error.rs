//! Error returned when a submitted call gives up

use crate::attempt::AttemptError;

/// Terminal failure of a submitted call: the last attempt's error, annotated
/// with the call label and how many attempts were made.
#[derive(Debug, thiserror::Error)]
#[error("{label} failed after {attempts} attempt(s): {source}")]
pub struct Error {
    pub label: String,
    pub attempts: u32,
    pub source: AttemptError,
}

impl Error {
    /// Upstream status of the final attempt, if it got that far.
    pub fn status(&self) -> Option<u16> {
        self.source.kind.status()
    }
}

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, Error>;
