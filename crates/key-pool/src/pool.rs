//! Key health tracking and round-robin selection
//!
//! The pool holds one health record per configured key and a rotating cursor.
//! Health and cursor live behind a single mutex so that a selection and a
//! concurrent failure report can never interleave halfway through.
//!
//! Time comes from `tokio::time::Instant`, which lets tests pause the clock
//! and step through cooldowns and reset windows deterministically.

use std::fmt;
use std::time::Duration;

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::is_rate_limit;
use crate::error::{Error, Result};

/// Tunables for key health transitions.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a rate-limited key is excluded from selection.
    pub cooldown: Duration,
    /// Consecutive failures after which a key is skipped.
    pub max_failures: u32,
    /// Quiet period after which a key's failure counter no longer counts.
    pub reset_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_failures: 3,
            reset_window: Duration::from_secs(300),
        }
    }
}

/// A key handed out by the pool, carried back in success/failure reports.
///
/// Debug output shows only the positional label (`key#2`), never the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    index: usize,
    secret: Secret<String>,
}

impl Credential {
    /// The raw key, for building the outbound request.
    pub fn expose(&self) -> &str {
        self.secret.expose()
    }

    /// 1-based position in the pool, for logs and metrics.
    pub fn label(&self) -> String {
        format!("key#{}", self.index + 1)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.label()).finish()
    }
}

/// Per-key health counters.
#[derive(Debug, Clone, Default)]
pub struct KeyHealth {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    pub total_requests: u64,
    pub total_successes: u64,
}

/// Derived state of a key at a given instant.
///
/// Transitions:
/// - Healthy → CoolingDown (429 reported)
/// - Healthy → Failed (`max_failures` consecutive failures)
/// - CoolingDown → Healthy (cooldown elapsed)
/// - Failed → Healthy (success reported, or `reset_window` since last failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Healthy,
    CoolingDown { until: Instant },
    Failed,
}

impl KeyState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Healthy => "healthy",
            KeyState::CoolingDown { .. } => "cooling_down",
            KeyState::Failed => "failed",
        }
    }
}

impl KeyHealth {
    fn cooling_until(&self, now: Instant) -> Option<Instant> {
        self.cooldown_until.filter(|until| now < *until)
    }

    fn failures_expired(&self, now: Instant, reset_window: Duration) -> bool {
        self.last_failure_at
            .is_none_or(|at| now.saturating_duration_since(at) > reset_window)
    }

    /// State as seen by an observer. Never mutates.
    pub fn state(&self, now: Instant, config: &PoolConfig) -> KeyState {
        if let Some(until) = self.cooling_until(now) {
            return KeyState::CoolingDown { until };
        }
        if self.consecutive_failures >= config.max_failures
            && !self.failures_expired(now, config.reset_window)
        {
            return KeyState::Failed;
        }
        KeyState::Healthy
    }

    /// Eligibility check used by selection. A failed key whose reset window
    /// has passed is eligible again and its counter is cleared here.
    fn claim(&mut self, now: Instant, config: &PoolConfig) -> bool {
        if self.cooling_until(now).is_some() {
            return false;
        }
        if self.consecutive_failures >= config.max_failures {
            if !self.failures_expired(now, config.reset_window) {
                return false;
            }
            self.consecutive_failures = 0;
        }
        true
    }
}

/// Aggregate key counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub healthy: usize,
    pub cooling_down: usize,
    pub failed: usize,
}

struct Entry {
    secret: Secret<String>,
    health: KeyHealth,
}

struct PoolState {
    entries: Vec<Entry>,
    cursor: usize,
}

/// Pool of provider API keys with health-aware round-robin selection.
pub struct KeyPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl KeyPool {
    /// Create a pool from the configured keys.
    ///
    /// Blank entries are dropped and duplicates tracked once. Fails with
    /// `NoCredentials` when nothing usable remains.
    pub fn new(keys: Vec<String>, config: PoolConfig) -> Result<Self> {
        let mut state = PoolState {
            entries: Vec::new(),
            cursor: 0,
        };
        track_keys(&mut state, keys)?;
        info!(
            keys = state.entries.len(),
            cooldown_secs = config.cooldown.as_secs(),
            max_failures = config.max_failures,
            reset_window_secs = config.reset_window.as_secs(),
            "key pool initialized"
        );
        Ok(Self {
            state: Mutex::new(state),
            config,
        })
    }

    /// Track any keys not already in the pool. Existing health is untouched.
    pub async fn init(&self, keys: Vec<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        track_keys(&mut state, keys)?;
        let added = state.entries.len() - before;
        if added > 0 {
            info!(added, keys = state.entries.len(), "keys added to pool");
        }
        Ok(())
    }

    /// Select the next usable key via round-robin.
    ///
    /// Scans every key starting at the cursor, skipping keys in cooldown and
    /// keys over the failure threshold. If nothing is usable, the key with the
    /// oldest failure is reset and returned instead.
    pub async fn select_next(&self) -> Credential {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let n = state.entries.len();
        let start = state.cursor % n;

        for offset in 0..n {
            let idx = (start + offset) % n;
            if state.entries[idx].health.claim(now, &self.config) {
                return hand_out(&mut state, idx);
            }
        }

        // Never-failed keys sort first, then oldest failure.
        let idx = state
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.health.last_failure_at)
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let health = &mut state.entries[idx].health;
        health.cooldown_until = None;
        health.consecutive_failures = 0;
        warn!(
            key = %format!("key#{}", idx + 1),
            keys = n,
            "all keys unhealthy, forcing least-recently-failed key"
        );
        hand_out(&mut state, idx)
    }

    /// Record a failed call made with `credential`.
    ///
    /// A 429 additionally starts a cooldown, independent of the counter.
    pub async fn report_failure(&self, credential: &Credential, status: Option<u16>) {
        let mut state = self.state.lock().await;
        let Some(entry) = find_entry(&mut state, credential) else {
            debug!(key = %credential.label(), "failure reported for untracked key");
            return;
        };
        let now = Instant::now();
        let health = &mut entry.health;

        // A counter that went quiet for a full window starts over.
        if health.failures_expired(now, self.config.reset_window) {
            health.consecutive_failures = 0;
        }
        health.consecutive_failures += 1;
        health.last_failure_at = Some(now);

        if status.is_some_and(is_rate_limit) {
            health.cooldown_until = Some(now + self.config.cooldown);
            warn!(
                key = %credential.label(),
                cooldown_secs = self.config.cooldown.as_secs(),
                "key rate limited, entering cooldown"
            );
        } else {
            warn!(
                key = %credential.label(),
                status = ?status,
                failures = health.consecutive_failures,
                max_failures = self.config.max_failures,
                "key failed"
            );
        }
    }

    /// Record a successful call. Clears the failure counter; an active
    /// cooldown still runs to completion.
    pub async fn report_success(&self, credential: &Credential) {
        let mut state = self.state.lock().await;
        let Some(entry) = find_entry(&mut state, credential) else {
            debug!(key = %credential.label(), "success reported for untracked key");
            return;
        };
        entry.health.consecutive_failures = 0;
        entry.health.total_successes += 1;
    }

    /// Key counts by state.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut status = PoolStatus {
            total: state.entries.len(),
            ..PoolStatus::default()
        };
        for entry in &state.entries {
            match entry.health.state(now, &self.config) {
                KeyState::Healthy => status.healthy += 1,
                KeyState::CoolingDown { .. } => status.cooling_down += 1,
                KeyState::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Number of keys that selection would currently accept.
    pub async fn healthy_count(&self) -> usize {
        self.status().await.healthy
    }

    /// Snapshot of one key's counters.
    pub async fn key_health(&self, credential: &Credential) -> Option<KeyHealth> {
        let mut state = self.state.lock().await;
        find_entry(&mut state, credential).map(|entry| entry.health.clone())
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all healthy → healthy, some healthy → degraded,
    /// none healthy → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut keys = Vec::with_capacity(state.entries.len());
        let mut healthy = 0usize;

        for (idx, entry) in state.entries.iter().enumerate() {
            let key_state = entry.health.state(now, &self.config);
            let mut key = serde_json::json!({
                "key": format!("key#{}", idx + 1),
                "status": key_state.label(),
                "consecutive_failures": entry.health.consecutive_failures,
                "total_requests": entry.health.total_requests,
                "total_successes": entry.health.total_successes,
            });
            match key_state {
                KeyState::Healthy => healthy += 1,
                KeyState::CoolingDown { until } => {
                    key["cooldown_remaining_secs"] =
                        serde_json::json!(until.saturating_duration_since(now).as_secs());
                }
                KeyState::Failed => {}
            }
            keys.push(key);
        }

        let total = state.entries.len();
        let pool_status = if healthy == total && total > 0 {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "keys_total": total,
            "keys_healthy": healthy,
            "keys": keys,
        })
    }
}

fn track_keys(state: &mut PoolState, keys: Vec<String>) -> Result<()> {
    let keys: Vec<String> = keys
        .into_iter()
        .map(|k| k.trim().to_owned())
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Err(Error::NoCredentials);
    }
    for key in keys {
        if state.entries.iter().any(|e| e.secret.expose() == &key) {
            continue;
        }
        state.entries.push(Entry {
            secret: Secret::new(key),
            health: KeyHealth::default(),
        });
    }
    Ok(())
}

fn find_entry<'a>(state: &'a mut PoolState, credential: &Credential) -> Option<&'a mut Entry> {
    state
        .entries
        .get_mut(credential.index)
        .filter(|entry| entry.secret == credential.secret)
}

fn hand_out(state: &mut PoolState, idx: usize) -> Credential {
    let n = state.entries.len();
    state.cursor = (idx + 1) % n;
    let entry = &mut state.entries[idx];
    entry.health.total_requests += 1;
    debug!(
        key = %format!("key#{}", idx + 1),
        keys = n,
        successes = entry.health.total_successes,
        recent_failures = entry.health.consecutive_failures,
        "key selected"
    );
    Credential {
        index: idx,
        secret: entry.secret.clone(),
    }
}
