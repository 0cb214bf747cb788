//! Typed outcome of a single upstream attempt
//!
//! Operations report which key they used alongside the result, so the queue
//! can attribute success and failure without understanding provider errors.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use key_pool::{Credential, KeyPool, classify_status};

/// Handed to the operation on every attempt.
///
/// Keys picked through `select_key` are remembered, so an attempt that is
/// cut off at its deadline is still charged to the key it was using.
#[derive(Clone)]
pub struct AttemptContext {
    number: u32,
    pool: Arc<KeyPool>,
    selected: Arc<Mutex<Option<Credential>>>,
}

impl AttemptContext {
    pub(crate) fn new(number: u32, pool: Arc<KeyPool>) -> Self {
        Self {
            number,
            pool,
            selected: Arc::new(Mutex::new(None)),
        }
    }

    /// 0-based attempt number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Pick the next key from the pool for this attempt.
    pub async fn select_key(&self) -> Credential {
        let credential = self.pool.select_next().await;
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        credential
    }

    /// The key most recently picked through this context, if any.
    pub fn selected(&self) -> Option<Credential> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptContext")
            .field("number", &self.number)
            .field("selected", &self.selected())
            .finish()
    }
}

/// A successful attempt: the value plus the key that produced it.
#[derive(Debug)]
pub struct Attempt<T> {
    pub value: T,
    pub credential: Credential,
    pub status: Option<u16>,
}

impl<T> Attempt<T> {
    pub fn new(value: T, credential: Credential) -> Self {
        Self {
            value,
            credential,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// What went wrong with an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Upstream answered with a non-success status
    Status(u16),
    /// The attempt ran past its deadline
    Timeout,
    /// Connection refused/reset or the request could not be sent
    Network,
    /// Upstream answered 2xx but the body was unusable
    InvalidResponse,
    Other,
}

impl FailureKind {
    pub fn status(self) -> Option<u16> {
        match self {
            FailureKind::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(self) -> bool {
        match self {
            FailureKind::Status(status) => classify_status(status).is_retriable(),
            FailureKind::Timeout | FailureKind::Network => true,
            FailureKind::InvalidResponse | FailureKind::Other => false,
        }
    }

    /// Label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Status(429) => "rate_limited",
            FailureKind::Status(status) if status >= 500 => "server_error",
            FailureKind::Status(_) => "client_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Status(status) => write!(f, "upstream status {status}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::InvalidResponse => write!(f, "invalid response"),
            FailureKind::Other => write!(f, "error"),
        }
    }
}

/// A failed attempt, attributed to the key it used when known.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub credential: Option<Credential>,
    pub message: String,
}

impl AttemptError {
    pub fn new(
        kind: FailureKind,
        credential: Option<Credential>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            credential,
            message: message.into(),
        }
    }

    pub fn status(status: u16, credential: Credential, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Status(status), Some(credential), message)
    }

    pub fn invalid_response(credential: Credential, message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidResponse, Some(credential), message)
    }

    /// Map a transport error from reqwest. The URL is stripped from the
    /// message since provider URLs may carry key material.
    pub fn from_reqwest(err: reqwest::Error, credential: Option<Credential>) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if let Some(status) = err.status() {
            FailureKind::Status(status.as_u16())
        } else if err.is_decode() {
            FailureKind::InvalidResponse
        } else if err.is_connect() || err.is_request() || err.is_body() {
            FailureKind::Network
        } else {
            FailureKind::Other
        };
        Self::new(kind, credential, err.without_url().to_string())
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}
