//! Lookup and store over an object store plus a metadata index
//!
//! The object store is authoritative. The index is consulted first because it
//! is cheap, but a miss there is confirmed with a `head` before reporting a
//! miss, and a hit found that way is written back to the index.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entry::{ArtifactContext, CacheEntry, now_millis};
use crate::error::Result;
use crate::key::CacheKey;
use crate::store::{MetadataIndex, ObjectStore};

/// Preview stored for records rebuilt from storage, where the text is unknown.
pub const RECOVERED_PREVIEW: &str = "(recovered from storage)";

const PREVIEW_CHARS: usize = 200;

/// Object naming for one artifact kind.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Key prefix inside the bucket, e.g. "speech/audio"
    pub prefix: String,
    pub extension: String,
    pub content_type: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prefix: "speech/audio".into(),
            extension: "wav".into(),
            content_type: "audio/wav".into(),
        }
    }
}

/// Where an artifact can be fetched and whether it was already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedArtifact {
    pub url: String,
    pub content_hash: String,
    pub variant: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
}

impl CachedArtifact {
    fn from_entry(entry: CacheEntry, cached: bool) -> Self {
        Self {
            url: entry.storage_url,
            content_hash: entry.content_hash,
            variant: entry.variant,
            cached,
            byte_size: entry.byte_size,
        }
    }
}

/// A freshly generated artifact to persist.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub content: String,
    pub variant: String,
    pub bytes: Vec<u8>,
    pub context: ArtifactContext,
}

pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn MetadataIndex>,
    settings: CacheSettings,
}

impl ArtifactCache {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        index: Arc<dyn MetadataIndex>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            index,
            settings,
        }
    }

    pub fn storage_key(&self, key: &CacheKey) -> String {
        key.storage_key(&self.settings.prefix, &self.settings.extension)
    }

    /// Find a previously stored artifact.
    ///
    /// Never fails: backend errors are logged and reported as a miss, which
    /// at worst costs a regeneration.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedArtifact> {
        match self.index.get(&key.hash, &key.variant).await {
            Ok(Some(entry)) => {
                debug!(hash = %key.hash, variant = %key.variant, "cache hit (index)");
                return Some(CachedArtifact::from_entry(entry, true));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    hash = %key.hash,
                    variant = %key.variant,
                    error = %e,
                    "metadata index read failed, checking storage"
                );
            }
        }

        let storage_key = self.storage_key(key);
        match self.store.head(&storage_key).await {
            Ok(true) => Some(self.recover(key, storage_key).await),
            Ok(false) => {
                debug!(hash = %key.hash, variant = %key.variant, "cache miss");
                None
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "storage head failed, treating as miss");
                None
            }
        }
    }

    /// Rebuild the index record for an object that exists in storage.
    async fn recover(&self, key: &CacheKey, storage_key: String) -> CachedArtifact {
        let entry = CacheEntry {
            content_hash: key.hash.clone(),
            variant: key.variant.clone(),
            storage_url: self.store.public_url(&storage_key),
            storage_key,
            byte_size: None,
            created_at: now_millis(),
            text_preview: RECOVERED_PREVIEW.into(),
            context: None,
        };
        let artifact = CachedArtifact::from_entry(entry.clone(), true);

        match self.index.upsert(entry).await {
            Ok(()) => info!(
                hash = %key.hash,
                variant = %key.variant,
                "found in storage but missing from index, re-inserted"
            ),
            Err(e) => warn!(
                hash = %key.hash,
                variant = %key.variant,
                error = %e,
                "found in storage but index repair failed"
            ),
        }
        artifact
    }

    /// Persist a generated artifact and record it in the index.
    ///
    /// If a concurrent request already stored the same key, its result is
    /// returned with `cached: true` and nothing is uploaded. An upload failure
    /// is an error; an index write failure is logged and ignored since the
    /// object is already durable and reachable.
    pub async fn store(&self, request: StoreRequest) -> Result<CachedArtifact> {
        let key = CacheKey::new(&request.content, &request.variant);

        if let Some(existing) = self.lookup(&key).await {
            debug!(hash = %key.hash, variant = %key.variant, "already stored, skipping upload");
            return Ok(existing);
        }

        let storage_key = self.storage_key(&key);
        let size = request.bytes.len() as u64;
        let url = self
            .store
            .put(&storage_key, request.bytes, &self.settings.content_type)
            .await?;
        info!(key = %storage_key, size, "stored artifact");

        let entry = CacheEntry {
            content_hash: key.hash,
            variant: key.variant,
            storage_url: url,
            storage_key,
            byte_size: Some(size),
            created_at: now_millis(),
            text_preview: request.content.trim().chars().take(PREVIEW_CHARS).collect(),
            context: (!request.context.is_empty()).then_some(request.context),
        };
        let artifact = CachedArtifact::from_entry(entry.clone(), false);

        if let Err(e) = self.index.upsert(entry).await {
            warn!(
                hash = %artifact.content_hash,
                variant = %artifact.variant,
                error = %e,
                "metadata write failed, artifact stored without index record"
            );
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::{MemoryIndex, MemoryObjectStore};
    use crate::store::BoxFuture;

    struct Harness {
        store: Arc<MemoryObjectStore>,
        index: Arc<MemoryIndex>,
        cache: ArtifactCache,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryObjectStore::new("https://cdn.test"));
        let index = Arc::new(MemoryIndex::new());
        let cache = ArtifactCache::new(store.clone(), index.clone(), CacheSettings::default());
        Harness {
            store,
            index,
            cache,
        }
    }

    fn request(content: &str, variant: &str) -> StoreRequest {
        StoreRequest {
            content: content.into(),
            variant: variant.into(),
            bytes: vec![7; 64],
            context: ArtifactContext {
                page_id: Some("page-1".into()),
                page_title: Some("Greetings".into()),
                section: Some("summary".into()),
            },
        }
    }

    /// Index that fails every call.
    struct BrokenIndex;

    impl MetadataIndex for BrokenIndex {
        fn get<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
            Box::pin(async { Err(Error::Index("connection reset".into())) })
        }

        fn upsert(&self, _: CacheEntry) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(Error::Index("connection reset".into())) })
        }
    }

    /// Store whose writes and heads always fail.
    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn put<'a>(&'a self, _: &'a str, _: Vec<u8>, _: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async { Err(Error::Storage("bucket unavailable".into())) })
        }

        fn head<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Err(Error::Storage("bucket unavailable".into())) })
        }

        fn public_url(&self, key: &str) -> String {
            format!("https://cdn.test/{key}")
        }
    }

    /// Memory store that yields before every call, so concurrent stores
    /// interleave between the re-check and the upload.
    struct YieldingStore(Arc<MemoryObjectStore>);

    impl ObjectStore for YieldingStore {
        fn put<'a>(
            &'a self,
            key: &'a str,
            bytes: Vec<u8>,
            content_type: &'a str,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.0.put(key, bytes, content_type).await
            })
        }

        fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.0.head(key).await
            })
        }

        fn public_url(&self, key: &str) -> String {
            self.0.public_url(key)
        }
    }

    #[tokio::test]
    async fn miss_on_empty_cache() {
        let h = harness();
        assert_eq!(h.cache.lookup(&CacheKey::new("hola", "es")).await, None);
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let h = harness();
        let stored = h.cache.store(request("Hola amigo", "es")).await.unwrap();
        assert!(!stored.cached);
        assert_eq!(stored.byte_size, Some(64));
        assert_eq!(
            stored.url,
            format!("https://cdn.test/speech/audio/{}-es.wav", stored.content_hash)
        );

        let found = h
            .cache
            .lookup(&CacheKey::new("  Hola amigo  ", "es"))
            .await
            .unwrap();
        assert!(found.cached);
        assert_eq!(found.url, stored.url);

        let entry = h
            .index
            .get(&stored.content_hash, "es")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.text_preview, "Hola amigo");
        assert_eq!(entry.context.unwrap().section.as_deref(), Some("summary"));

        let object = h.store.get(&entry.storage_key).await.unwrap();
        assert_eq!(object.content_type, "audio/wav");
    }

    #[tokio::test]
    async fn variants_are_cached_separately() {
        let h = harness();
        h.cache.store(request("hello", "fr")).await.unwrap();
        assert!(h.cache.lookup(&CacheKey::new("hello", "fr")).await.is_some());
        assert!(h.cache.lookup(&CacheKey::new("hello", "de")).await.is_none());
    }

    #[tokio::test]
    async fn repeated_store_does_not_reupload() {
        let h = harness();
        let first = h.cache.store(request("hello", "fr")).await.unwrap();
        let second = h.cache.store(request("hello", "fr")).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.url, second.url);
        assert_eq!(h.store.put_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_stores_converge_on_one_object() {
        let h = harness();
        let (a, b) = tokio::join!(
            h.cache.store(request("same text", "it")),
            h.cache.store(request("same text", "it")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.url, b.url);
        assert_eq!(h.store.len().await, 1);
        assert_eq!(h.index.len().await, 1);

        let found = h.cache.lookup(&CacheKey::new("same text", "it")).await;
        assert_eq!(found.map(|f| f.url), Some(a.url));
    }

    #[tokio::test]
    async fn racing_stores_both_upload_to_one_key() {
        let objects = Arc::new(MemoryObjectStore::new("https://cdn.test"));
        let index = Arc::new(MemoryIndex::new());
        let cache = ArtifactCache::new(
            Arc::new(YieldingStore(objects.clone())),
            index.clone(),
            CacheSettings::default(),
        );

        let (a, b) = tokio::join!(
            cache.store(request("same text", "it")),
            cache.store(request("same text", "it")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // Both callers passed the re-check before either upload landed.
        assert!(!a.cached);
        assert!(!b.cached);
        assert_eq!(objects.put_count(), 2);
        assert_eq!(objects.len().await, 1);
        assert_eq!(index.len().await, 1);
        assert_eq!(a.url, b.url);

        let found = cache.lookup(&CacheKey::new("same text", "it")).await;
        assert_eq!(found.map(|f| f.url), Some(a.url));
    }

    #[tokio::test]
    async fn lost_index_record_is_recovered_from_storage() {
        let h = harness();
        let stored = h.cache.store(request("bonjour", "fr")).await.unwrap();
        h.index.remove(&stored.content_hash, "fr").await.unwrap();

        let found = h
            .cache
            .lookup(&CacheKey::new("bonjour", "fr"))
            .await
            .unwrap();
        assert!(found.cached);
        assert_eq!(found.url, stored.url);
        assert_eq!(found.byte_size, None);

        let healed = h
            .index
            .get(&stored.content_hash, "fr")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healed.text_preview, RECOVERED_PREVIEW);
        assert_eq!(healed.storage_url, stored.url);
    }

    #[tokio::test]
    async fn index_failure_falls_back_to_storage() {
        let store = Arc::new(MemoryObjectStore::new("https://cdn.test"));
        let cache =
            ArtifactCache::new(store.clone(), Arc::new(BrokenIndex), CacheSettings::default());

        assert!(cache.lookup(&CacheKey::new("ciao", "it")).await.is_none());

        // Index writes fail but the object is durable, so the store succeeds.
        let stored = cache.store(request("ciao", "it")).await.unwrap();
        assert!(!stored.cached);
        assert_eq!(store.len().await, 1);

        let found = cache.lookup(&CacheKey::new("ciao", "it")).await.unwrap();
        assert_eq!(found.url, stored.url);
    }

    #[tokio::test]
    async fn storage_failures() {
        let cache = ArtifactCache::new(
            Arc::new(BrokenStore),
            Arc::new(MemoryIndex::new()),
            CacheSettings::default(),
        );
        assert!(cache.lookup(&CacheKey::new("ciao", "it")).await.is_none());

        let err = cache.store(request("ciao", "it")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "{err}");
    }

    #[tokio::test]
    async fn preview_is_truncated_and_context_optional() {
        let h = harness();
        let long = "a".repeat(500);
        let mut req = request(&long, "en");
        req.context = ArtifactContext::default();
        let stored = h.cache.store(req).await.unwrap();

        let entry = h
            .index
            .get(&stored.content_hash, "en")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.text_preview.chars().count(), 200);
        assert!(entry.context.is_none());
    }
}
