//! Metadata index persisted as a JSON file
//!
//! The whole map lives in memory behind a tokio Mutex; every upsert rewrites
//! the file with temp-file + rename so a crash never leaves it half written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::entry::CacheEntry;
use crate::error::{Error, Result};
use crate::store::{BoxFuture, MetadataIndex};

pub struct JsonFileIndex {
    path: PathBuf,
    state: Mutex<HashMap<String, CacheEntry>>,
}

fn record_key(content_hash: &str, variant: &str) -> String {
    format!("{content_hash}/{variant}")
}

impl JsonFileIndex {
    /// Load the index from `path`, creating an empty file if it is missing.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading metadata index: {e}")))?;
            let entries: HashMap<String, CacheEntry> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing metadata index: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded metadata index");
            entries
        } else {
            info!(path = %path.display(), "metadata index not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl MetadataIndex for JsonFileIndex {
    fn get<'a>(
        &'a self,
        content_hash: &'a str,
        variant: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(&record_key(content_hash, variant)).cloned())
        })
    }

    fn upsert(&self, entry: CacheEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let key = record_key(&entry.content_hash, &entry.variant);
            let previous = state.insert(key.clone(), entry);
            if let Err(e) = write_atomic(&self.path, &state).await {
                // Keep memory consistent with what is on disk.
                match previous {
                    Some(previous) => state.insert(key, previous),
                    None => state.remove(&key),
                };
                return Err(e);
            }
            debug!(record = %key, "upserted metadata");
            Ok(())
        })
    }
}

async fn write_atomic(path: &Path, data: &HashMap<String, CacheEntry>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing metadata index: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("metadata index path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".into());

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp metadata index: {e}")))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp metadata index: {e}")))?;

    debug!(path = %path.display(), "persisted metadata index");
    Ok(())
}
