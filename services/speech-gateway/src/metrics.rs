//! Prometheus metrics exposition
//!
//! - `speech_requests_total` (counter): label `status`
//! - `speech_request_duration_seconds` (histogram): label `status`
//! - `speech_cache_lookups_total` (counter): label `result` (hit/miss)
//! - `upstream_attempt_failures_total` (counter): label `kind`
//! - `key_pool_keys` (gauge): label `state`
//! - `request_queue_active`, `request_queue_waiting` (gauges)

use key_pool::PoolStatus;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use request_queue::QueueStats;

/// Bucket boundaries from 50ms to 5 minutes; a cache miss with retries can
/// legitimately take minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("speech_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed speech request.
pub fn record_request(status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("speech_requests_total", "status" => status.clone()).increment(1);
    metrics::histogram!("speech_request_duration_seconds", "status" => status)
        .record(duration_secs);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("speech_cache_lookups_total", "result" => result).increment(1);
}

/// Record one failed upstream attempt, retried or not.
pub fn record_attempt_failure(kind: &'static str) {
    metrics::counter!("upstream_attempt_failures_total", "kind" => kind).increment(1);
}

/// Refresh the pool and queue gauges from a snapshot.
pub fn set_gauges(pool: &PoolStatus, queue: &QueueStats) {
    metrics::gauge!("key_pool_keys", "state" => "healthy").set(pool.healthy as f64);
    metrics::gauge!("key_pool_keys", "state" => "cooling_down").set(pool.cooling_down as f64);
    metrics::gauge!("key_pool_keys", "state" => "failed").set(pool.failed as f64);
    metrics::gauge!("request_queue_active").set(queue.active as f64);
    metrics::gauge!("request_queue_waiting").set(queue.queued as f64);
}
