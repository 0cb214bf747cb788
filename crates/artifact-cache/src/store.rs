//! Backend ports for durable bytes and the metadata index
//!
//! Both traits return boxed futures so they stay dyn-compatible and the cache
//! can hold `Arc<dyn ObjectStore>` / `Arc<dyn MetadataIndex>`.

use std::future::Future;
use std::pin::Pin;

use crate::entry::CacheEntry;
use crate::error::Result;

/// Boxed, sendable future returned by backend operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable binary object storage addressed by key.
pub trait ObjectStore: Send + Sync {
    /// Upload `bytes` under `key`, returning the object's public URL.
    /// Writing the same key twice replaces the object.
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    /// Whether an object exists under `key`, without downloading it.
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Public URL an object under `key` is (or would be) served from.
    fn public_url(&self, key: &str) -> String;
}

/// Queryable index of artifact metadata keyed by (content hash, variant).
pub trait MetadataIndex: Send + Sync {
    fn get<'a>(
        &'a self,
        content_hash: &'a str,
        variant: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>>;

    /// Insert or replace the record for the entry's (hash, variant).
    fn upsert(&self, entry: CacheEntry) -> BoxFuture<'_, Result<()>>;
}
