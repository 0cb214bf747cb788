//! Slot accounting and the retry loop
//!
//! `active` counts calls holding a slot; parked callers wait on a oneshot in
//! a FIFO list. Releasing a slot sends it to the oldest live waiter without
//! touching `active`, so a freed slot can never be grabbed by a newcomer
//! ahead of someone already waiting. The slot mutex is never held across an
//! await point.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use key_pool::KeyPool;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::attempt::{Attempt, AttemptContext, AttemptError, FailureKind};
use crate::backoff::Backoff;
use crate::error::{Error, Result};

/// Queue limits and retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on calls in flight to the upstream, across all callers.
    pub max_concurrent: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Deadline for a single attempt; elapsing counts as a retriable failure.
    pub attempt_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            backoff: Backoff::default(),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Snapshot of slot usage for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

struct Slots {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Concurrency-limited retry queue in front of the upstream provider.
pub struct RequestQueue {
    pool: Arc<KeyPool>,
    slots: Mutex<Slots>,
    config: QueueConfig,
}

impl RequestQueue {
    /// A `max_concurrent` of 0 is raised to 1.
    pub fn new(pool: Arc<KeyPool>, mut config: QueueConfig) -> Self {
        if config.max_concurrent == 0 {
            warn!("max_concurrent of 0 would park every caller, using 1");
            config.max_concurrent = 1;
        }
        info!(
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            attempt_timeout_secs = config.attempt_timeout.as_secs(),
            "request queue initialized"
        );
        Self {
            pool,
            slots: Mutex::new(Slots {
                active: 0,
                waiters: VecDeque::new(),
            }),
            config,
        }
    }

    /// Run `operation` under a concurrency slot, retrying retriable failures.
    ///
    /// `operation` receives an `AttemptContext` carrying the 0-based attempt
    /// number; it picks its key with `AttemptContext::select_key`. Attempts
    /// run one after another while the slot is held. A failure is charged to
    /// the key it names, or else to the key selected through the context. The
    /// final error carries `label` and the number of attempts made.
    pub async fn submit<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Attempt<T>, AttemptError>>,
    {
        let _slot = self.acquire().await;
        let stats = self.stats();
        info!(
            label,
            active = stats.active,
            queued = stats.queued,
            max_concurrent = stats.max_concurrent,
            "request started"
        );

        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            let ctx = AttemptContext::new(attempt, self.pool.clone());
            let deadline = self.config.attempt_timeout;
            let outcome = match tokio::time::timeout(deadline, operation(ctx.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AttemptError::new(
                    FailureKind::Timeout,
                    ctx.selected(),
                    format!("attempt exceeded {}ms deadline", deadline.as_millis()),
                )),
            };

            let err = match outcome {
                Ok(done) => {
                    self.pool.report_success(&done.credential).await;
                    info!(
                        label,
                        attempt = attempt + 1,
                        key = %done.credential.label(),
                        status = ?done.status,
                        "request completed"
                    );
                    return Ok(done.value);
                }
                Err(mut err) => {
                    if err.credential.is_none() {
                        err.credential = ctx.selected();
                    }
                    err
                }
            };

            if let Some(credential) = &err.credential {
                self.pool
                    .report_failure(credential, err.kind.status())
                    .await;
            }

            let attempts = attempt + 1;
            if err.is_retriable() && attempts < max_attempts {
                let delay = self.config.backoff.delay(attempt);
                warn!(
                    label,
                    attempt = attempts,
                    max_attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            error!(label, attempts, error = %err, "request failed permanently");
            return Err(Error {
                label: label.to_string(),
                attempts,
                source: err,
            });
        }
    }

    /// Current slot usage. Cancelled waiters are not counted.
    pub fn stats(&self) -> QueueStats {
        let slots = self.lock_slots();
        QueueStats {
            active: slots.active,
            queued: slots.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            max_concurrent: self.config.max_concurrent,
        }
    }

    async fn acquire(&self) -> SlotGuard<'_> {
        loop {
            let rx = {
                let mut slots = self.lock_slots();
                if slots.active < self.config.max_concurrent {
                    slots.active += 1;
                    return SlotGuard { queue: self };
                }
                let (tx, rx) = oneshot::channel();
                slots.waiters.push_back(tx);
                rx
            };

            let mut waiter = Waiter {
                rx,
                queue: self,
                granted: false,
            };
            if (&mut waiter.rx).await.is_ok() {
                waiter.granted = true;
                return SlotGuard { queue: self };
            }
            debug!("slot sender dropped without a grant, requeueing");
        }
    }

    fn release(&self) {
        let mut slots = self.lock_slots();
        while let Some(tx) = slots.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        slots.active = slots.active.saturating_sub(1);
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held concurrency slot, released on drop.
struct SlotGuard<'a> {
    queue: &'a RequestQueue,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// A parked caller. If it is dropped after a slot was already sent to it,
/// the slot is passed on instead of leaking.
struct Waiter<'a> {
    rx: oneshot::Receiver<()>,
    queue: &'a RequestQueue,
    granted: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.queue.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_pool::{Credential, PoolConfig};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn test_queue(max_concurrent: usize) -> (Arc<KeyPool>, Arc<RequestQueue>) {
        queue_over(vec!["k1", "k2", "k3"], max_concurrent, Duration::from_secs(30))
    }

    fn queue_over(
        keys: Vec<&str>,
        max_concurrent: usize,
        attempt_timeout: Duration,
    ) -> (Arc<KeyPool>, Arc<RequestQueue>) {
        let keys = keys.into_iter().map(String::from).collect();
        let pool = Arc::new(KeyPool::new(keys, PoolConfig::default()).unwrap());
        let queue = Arc::new(RequestQueue::new(
            pool.clone(),
            QueueConfig {
                max_concurrent,
                max_retries: 3,
                backoff: Backoff {
                    base: Duration::from_millis(100),
                    max: Duration::from_secs(5),
                    jitter: Duration::from_millis(50),
                },
                attempt_timeout,
            },
        ));
        (pool, queue)
    }

    async fn succeed<T>(
        ctx: AttemptContext,
        value: T,
    ) -> std::result::Result<Attempt<T>, AttemptError> {
        Ok(Attempt::new(value, ctx.select_key().await))
    }

    #[tokio::test]
    async fn success_returns_value_and_reports_key() {
        let (pool, queue) = test_queue(2);
        let value = queue
            .submit("summary", |ctx| async move {
                let key = ctx.select_key().await;
                Ok::<_, AttemptError>(Attempt::new(42, key).with_status(200))
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(queue.stats().active, 0);

        let health = pool.health().await;
        assert_eq!(health["keys"][0]["total_successes"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_failure_attempted_once() {
        let (pool, queue) = test_queue(2);
        let calls = Arc::new(AtomicU32::new(0));

        let err = queue
            .submit("tts", |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = ctx.select_key().await;
                    Err::<Attempt<()>, _>(AttemptError::status(400, key, "bad request"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.label, "tts");
        assert_eq!(err.status(), Some(400));
        assert_eq!(pool.health().await["keys"][0]["consecutive_failures"], 1);
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_response_not_retried() {
        let (_pool, queue) = test_queue(1);
        let calls = Arc::new(AtomicU32::new(0));
        let err = queue
            .submit("tts", |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = ctx.select_key().await;
                    Err::<Attempt<()>, _>(AttemptError::invalid_response(key, "no audio part"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.source.kind, FailureKind::InvalidResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn retriable_failures_then_success() {
        let (_pool, queue) = test_queue(2);
        let calls = Arc::new(AtomicU32::new(0));

        let value = queue
            .submit("tts", |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = ctx.select_key().await;
                    if ctx.number() < 3 {
                        Err(AttemptError::status(503, key, "overloaded"))
                    } else {
                        Ok::<_, AttemptError>(Attempt::new("audio", key))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "audio");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_reports_attempt_count() {
        let (_pool, queue) = test_queue(2);
        let calls = Arc::new(AtomicU32::new(0));

        let err = queue
            .submit("video-analysis", |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = ctx.select_key().await;
                    Err::<Attempt<()>, _>(AttemptError::status(500, key, "internal"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert!(err.to_string().contains("video-analysis failed after 4 attempt(s)"));
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_moves_to_another_key() {
        let (pool, queue) = test_queue(1);
        let used = Arc::new(Mutex::new(Vec::new()));

        queue
            .submit("tts", |ctx| {
                let used = used.clone();
                async move {
                    let key = ctx.select_key().await;
                    used.lock().unwrap().push(key.expose().to_string());
                    if ctx.number() == 0 {
                        Err(AttemptError::status(429, key, "quota"))
                    } else {
                        Ok::<_, AttemptError>(Attempt::new((), key))
                    }
                }
            })
            .await
            .unwrap();

        let used = used.lock().unwrap().clone();
        assert_eq!(used, vec!["k1", "k2"]);
        assert_eq!(pool.status().await.cooling_down, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_is_retried() {
        let (pool, queue) = test_queue(1);
        let value = queue
            .submit("slow", |ctx| async move {
                let key = ctx.select_key().await;
                if ctx.number() == 0 {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                }
                Ok::<_, AttemptError>(Attempt::new(ctx.number(), key))
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(queue.stats().active, 0);

        let health = pool.health().await;
        assert_eq!(health["keys"][0]["consecutive_failures"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_key_is_charged_and_avoided() {
        let (pool, queue) = queue_over(vec!["hang", "ok"], 1, Duration::from_secs(1));
        let hung = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let hung = hung.clone();
            let value = queue
                .submit("tts", move |ctx| {
                    let hung = hung.clone();
                    async move {
                        let key = ctx.select_key().await;
                        if key.expose() == "hang" {
                            hung.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(100)).await;
                        }
                        Ok::<_, AttemptError>(Attempt::new(key.expose().to_string(), key))
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, "ok");
        }

        // Charged once per timeout until MAX_FAILURES marks it failed.
        let max_failures = PoolConfig::default().max_failures as usize;
        assert_eq!(hung.load(Ordering::SeqCst), max_failures);
        let status = pool.status().await;
        assert_eq!(status.failed, 1);
        assert_eq!(status.healthy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_without_credential_charged_to_selected_key() {
        let (pool, queue) = test_queue(1);
        let err = queue
            .submit("tts", |ctx| async move {
                let _key = ctx.select_key().await;
                Err::<Attempt<()>, _>(AttemptError::new(FailureKind::Other, None, "broken"))
            })
            .await
            .unwrap_err();

        let charged: Option<Credential> = err.source.credential.clone();
        assert_eq!(charged.map(|c| c.label()), Some("key#1".to_string()));
        assert_eq!(pool.health().await["keys"][0]["consecutive_failures"], 1);
    }

    #[tokio::test]
    async fn zero_concurrency_is_raised_to_one() {
        let (_pool, queue) = test_queue(0);
        assert_eq!(queue.stats().max_concurrent, 1);

        let value = tokio::time::timeout(
            Duration::from_secs(5),
            queue.submit("tts", |ctx| succeed(ctx, "ran")),
        )
        .await
        .expect("submit must not park forever")
        .unwrap();
        assert_eq!(value, "ran");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_bounded_and_fifo() {
        let (_pool, queue) = test_queue(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..6usize {
            let queue = queue.clone();
            let (running, peak, started) = (running.clone(), peak.clone(), started.clone());
            handles.push(tokio::spawn(async move {
                queue
                    .submit("long", move |ctx| {
                        let (running, peak, started) =
                            (running.clone(), peak.clone(), started.clone());
                        async move {
                            started.lock().unwrap().push(id);
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            succeed(ctx, id).await
                        }
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            queue.stats(),
            QueueStats {
                active: 0,
                queued: 0,
                max_concurrent: 2,
            }
        );
    }

    #[tokio::test]
    async fn stats_show_active_and_queued() {
        let (_pool, queue) = test_queue(1);
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let (queue, gate) = (queue.clone(), gate.clone());
            handles.push(tokio::spawn(async move {
                queue
                    .submit("gated", move |ctx| {
                        let gate = gate.clone();
                        async move {
                            gate.notified().await;
                            succeed(ctx, ()).await
                        }
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        assert_eq!(
            queue.stats(),
            QueueStats {
                active: 1,
                queued: 2,
                max_concurrent: 1,
            }
        );

        for handle in handles {
            // Wake whichever call currently holds the slot.
            while !handle.is_finished() {
                gate.notify_one();
                tokio::task::yield_now().await;
            }
            handle.await.unwrap().unwrap();
        }
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_leak_slot() {
        let (_pool, queue) = test_queue(1);

        let holder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("holder", |ctx| async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        succeed(ctx, ()).await
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.stats().active, 1);

        let impatient = queue.submit("impatient", |ctx| succeed(ctx, ()));
        let timed_out = tokio::time::timeout(Duration::from_secs(1), impatient).await;
        assert!(timed_out.is_err());
        assert_eq!(queue.stats().queued, 0);

        holder.await.unwrap().unwrap();
        assert_eq!(queue.stats().active, 0);

        let value = queue.submit("after", |ctx| succeed(ctx, "ok")).await.unwrap();
        assert_eq!(value, "ok");
        assert_eq!(queue.stats().active, 0);
    }
}
