//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys and the storage token are loaded from env vars or referenced
//! files, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::PoolConfig;
use request_queue::{Backoff, QueueConfig};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolSection,
    pub queue: QueueSection,
    pub cache: CacheSection,
}

/// Inbound HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 1000,
        }
    }
}

/// Speech provider settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    pub voice: String,
    /// Per-attempt deadline
    pub timeout_secs: u64,
    /// File with one API key per line (used when no key env var is set)
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".into(),
            model: "gemini-2.5-flash-preview-tts".into(),
            voice: "Kore".into(),
            timeout_secs: 60,
            api_keys_file: None,
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub cooldown_secs: u64,
    pub max_failures: u32,
    pub reset_window_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            max_failures: 3,
            reset_window_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

/// Where artifact bytes live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process map; lost on restart
    #[default]
    Memory,
    /// Bucket proxy over HTTP PUT/HEAD with a bearer token
    Http,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub backend: StorageBackend,
    /// Write endpoint for the http backend
    pub endpoint: Option<String>,
    /// Base of the URLs handed back to clients
    pub public_base_url: String,
    pub prefix: String,
    /// JSON metadata index; kept in memory only when unset
    pub index_path: Option<PathBuf>,
    /// File holding the bucket token (used when STORAGE_TOKEN is not set)
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            endpoint: None,
            public_base_url: "http://127.0.0.1:8080/artifacts".into(),
            prefix: "speech/audio".into(),
            index_path: None,
            token_file: None,
            token: None,
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_failures: self.max_failures,
            reset_window: Duration::from_secs(self.reset_window_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. GOOGLE_API_KEYS env var (comma separated)
    /// 2. GEMINI_API_KEY env var
    /// 3. upstream.api_keys_file
    ///
    /// Storage token: STORAGE_TOKEN env var, then cache.token_file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.upstream.api_keys = resolve_api_keys(config.upstream.api_keys_file.as_deref())?;
        config.cache.token = resolve_secret("STORAGE_TOKEN", config.cache.token_file.as_deref())?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("upstream.base_url", &self.upstream.base_url)?;
        require_http_url("cache.public_base_url", &self.cache.public_base_url)?;

        if self.cache.backend == StorageBackend::Http {
            let endpoint = self.cache.endpoint.as_deref().ok_or_else(|| {
                common::Error::Config("cache.endpoint is required for the http backend".into())
            })?;
            require_http_url("cache.endpoint", endpoint)?;
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(common::Error::Config(
                "queue.max_concurrent must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.pool.max_failures == 0 {
            return Err(common::Error::Config(
                "pool.max_failures must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
            max_retries: self.queue.max_retries,
            backoff: Backoff {
                base: Duration::from_millis(self.queue.base_delay_ms),
                max: Duration::from_millis(self.queue.max_delay_ms),
                jitter: Duration::from_millis(self.queue.jitter_ms),
            },
            attempt_timeout: Duration::from_secs(self.upstream.timeout_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("speech-gateway.toml")
    }
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )))
    }
}

fn split_keys<'a>(raw: &'a str, separator: char) -> impl Iterator<Item = Secret<String>> + 'a {
    raw.split(separator)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
}

fn resolve_api_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    if let Ok(keys) = std::env::var("GOOGLE_API_KEYS") {
        let keys: Vec<_> = split_keys(&keys, ',').collect();
        if !keys.is_empty() {
            return Ok(keys);
        }
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        let key = key.trim();
        if !key.is_empty() {
            return Ok(vec![Secret::new(key.to_owned())]);
        }
    }
    match keys_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    path.display()
                ))
            })?;
            Ok(split_keys(&contents, '\n').collect())
        }
        None => Ok(Vec::new()),
    }
}

fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value.to_owned())));
        }
    }
    let Some(path) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| Secret::new(value.to_owned())))
}
