//! Jittered exponential backoff between retry attempts

use std::time::Duration;

use rand::RngExt;

/// `delay = min(max, base * 2^attempt + jitter)` with jitter drawn uniformly
/// from `[0, jitter]` so concurrently failing callers spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl Backoff {
    /// Delay before retrying after the given (0-based) attempt failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.delay_with_jitter(attempt, jitter)
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponential = self.base.saturating_mul(2u32.saturating_pow(attempt));
        exponential.saturating_add(jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.delay_with_jitter(0, Duration::ZERO),
            Duration::from_secs(1)
        );
        assert_eq!(
            backoff.delay_with_jitter(1, Duration::ZERO),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.delay_with_jitter(3, Duration::ZERO),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn capped_at_max() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.delay_with_jitter(5, Duration::from_millis(499)),
            Duration::from_secs(30)
        );
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = Backoff::default();
        for _ in 0..200 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_millis(2000), "{delay:?}");
            assert!(delay <= Duration::from_millis(2500), "{delay:?}");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let backoff = Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            jitter: Duration::ZERO,
        };
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
    }
}
