//! In-process backends, used for local runs and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::store::{BoxFuture, MetadataIndex, ObjectStore};

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object store backed by a map. Public URLs are `{base_url}/{key}`.
pub struct MemoryObjectStore {
    base_url: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `put` calls served so far, including overwrites.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.objects.lock().await.insert(
                key.to_string(),
                StoredObject {
                    bytes,
                    content_type: content_type.to_string(),
                },
            );
            self.puts.fetch_add(1, Ordering::Relaxed);
            Ok(self.public_url(key))
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.objects.lock().await.contains_key(key)) })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

/// Metadata index backed by a map keyed on (hash, variant).
#[derive(Default)]
pub struct MemoryIndex {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a record, simulating an index that lost it.
    pub async fn remove(&self, content_hash: &str, variant: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .await
            .remove(&(content_hash.to_string(), variant.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl MetadataIndex for MemoryIndex {
    fn get<'a>(
        &'a self,
        content_hash: &'a str,
        variant: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(entries
                .get(&(content_hash.to_string(), variant.to_string()))
                .cloned())
        })
    }

    fn upsert(&self, entry: CacheEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let key = (entry.content_hash.clone(), entry.variant.clone());
            self.entries.lock().await.insert(key, entry);
            Ok(())
        })
    }
}
