//! Status code classification for upstream provider responses
//!
//! Rate limits and server-side failures are worth another attempt; client
//! errors describe a request that will fail the same way on every key.

/// How an upstream failure should be treated by the pool and the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// 429: cool the key down and retry, preferably on another key
    RateLimited,
    /// 408/5xx and unknown statuses: retry with backoff
    Transient,
    /// Other 4xx: the request itself is wrong, retrying cannot succeed
    Permanent,
}

impl ErrorClassification {
    pub fn is_retriable(self) -> bool {
        !matches!(self, ErrorClassification::Permanent)
    }
}

/// Whether a status code signals provider-side rate limiting.
pub fn is_rate_limit(status: u16) -> bool {
    status == 429
}

/// Classify an upstream HTTP status code.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        408 => ErrorClassification::Transient,
        400..=499 => ErrorClassification::Permanent,
        500..=599 => ErrorClassification::Transient,
        _ => ErrorClassification::Transient,
    }
}
