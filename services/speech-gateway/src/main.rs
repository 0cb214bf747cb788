//! Speech Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads provider API keys into a health-tracked key pool
//! 2. Serves `POST /v1/speech`, answering from the artifact cache when it can
//! 3. Sends cache misses through the concurrency-limited retry queue
//! 4. Stores generated audio under a content-addressed key and returns its URL

mod config;
mod error;
mod metrics;
mod speech;
mod synth;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use artifact_cache::{
    ArtifactCache, CacheSettings, HttpObjectStore, JsonFileIndex, MemoryIndex, MemoryObjectStore,
    MetadataIndex, ObjectStore,
};
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::KeyPool;
use metrics_exporter_prometheus::PrometheusHandle;
use request_queue::RequestQueue;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StorageBackend};
use crate::speech::{SpeechRequest, SpeechState};
use crate::synth::GeminiTts;

/// How long in-flight requests may run after a shutdown signal. A cache miss
/// with retries can take tens of seconds.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    speech: SpeechState,
    pool: Arc<KeyPool>,
    /// Set when audio lives in process memory, so it can be served locally
    artifacts: Option<Arc<MemoryObjectStore>>,
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    prometheus: PrometheusHandle,
}

/// Decrements the in-flight counter when a request finishes.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn start(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/speech", post(speech_handler))
        .route("/artifacts/{*key}", get(artifact_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting speech-gateway");

    // Install before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.upstream.base_url,
        model = %config.upstream.model,
        keys = config.upstream.api_keys.len(),
        backend = ?config.cache.backend,
        "configuration loaded"
    );

    let keys = config
        .upstream
        .api_keys
        .iter()
        .map(|k| k.expose().clone())
        .collect();
    let pool = Arc::new(
        KeyPool::new(keys, config.pool.to_pool_config()).context(
            "no API keys: set GOOGLE_API_KEYS, GEMINI_API_KEY or upstream.api_keys_file",
        )?,
    );
    let queue = Arc::new(RequestQueue::new(pool.clone(), config.queue_config()));

    let client = reqwest::Client::new();
    let (store, artifacts): (Arc<dyn ObjectStore>, Option<Arc<MemoryObjectStore>>) =
        match config.cache.backend {
            StorageBackend::Memory => {
                let store = Arc::new(MemoryObjectStore::new(&config.cache.public_base_url));
                (store.clone() as Arc<dyn ObjectStore>, Some(store))
            }
            StorageBackend::Http => {
                let endpoint = config
                    .cache
                    .endpoint
                    .clone()
                    .context("cache.endpoint is required for the http backend")?;
                let store = HttpObjectStore::new(
                    client.clone(),
                    endpoint,
                    &config.cache.public_base_url,
                    config.cache.token.clone(),
                );
                (Arc::new(store) as Arc<dyn ObjectStore>, None)
            }
        };
    let index: Arc<dyn MetadataIndex> = match &config.cache.index_path {
        Some(path) => Arc::new(
            JsonFileIndex::load(path.clone())
                .await
                .with_context(|| format!("failed to load metadata index {}", path.display()))?,
        ),
        None => Arc::new(MemoryIndex::new()),
    };
    let cache = Arc::new(ArtifactCache::new(
        store,
        index,
        CacheSettings {
            prefix: config.cache.prefix.clone(),
            ..CacheSettings::default()
        },
    ));

    let tts = GeminiTts::new(
        client,
        &config.upstream.base_url,
        &config.upstream.model,
        &config.upstream.voice,
    );

    let app_state = AppState {
        speech: SpeechState { queue, cache, tts },
        pool,
        artifacts,
        started_at: Instant::now(),
        requests_total: Arc::new(AtomicU64::new(0)),
        in_flight: Arc::new(AtomicU64::new(0)),
        prometheus: prometheus_handle,
    };
    let in_flight = app_state.in_flight.clone();

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn speech_handler(
    State(state): State<AppState>,
    payload: std::result::Result<axum::Json<SpeechRequest>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let _in_flight = InFlight::start(&state.in_flight);
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let response = match payload {
        Ok(axum::Json(request)) => {
            speech::synthesize_speech(&state.speech, request, request_id).await
        }
        Err(rejection) => speech::error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &rejection.body_text(),
            &request_id,
        ),
    };

    metrics::record_request(response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Health endpoint: key pool detail, queue occupancy and uptime.
/// Returns 200 while at least one key is selectable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.health().await;
    let healthy = state.pool.healthy_count().await;
    let queue = state.speech.queue.stats();

    let status_code = if healthy > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = pool["status"].clone();
    let body = serde_json::json!({
        "status": status,
        "pool": pool,
        "queue": queue,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.requests_total.load(Ordering::Relaxed),
        "in_flight": state.in_flight.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint; gauges are refreshed on every scrape.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.status().await;
    metrics::set_gauges(&pool, &state.speech.queue.stats());
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Serves audio held by the in-memory store.
async fn artifact_handler(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let Some(store) = &state.artifacts else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match store.get(&key).await {
        Some(object) => (
            [(axum::http::header::CONTENT_TYPE, object.content_type)],
            object.bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
