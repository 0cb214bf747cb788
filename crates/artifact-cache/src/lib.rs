//! Content-addressed cache for generated artifacts (synthesized speech)
//!
//! An artifact's storage key is a pure function of the text that produced it
//! and a variant such as the target language, so identical requests land on
//! the same object and never pay for generation or upload twice.
//!
//! Two backends cooperate:
//! - `ObjectStore`: durable bytes, the source of truth (put / head / public URL)
//! - `MetadataIndex`: fast lookup by (hash, variant); only an accelerator
//!
//! A lookup that misses the index falls back to a `head` on the store and
//! re-inserts the index record when the object is there.

pub mod cache;
pub mod entry;
pub mod error;
pub mod file_index;
pub mod http_store;
pub mod key;
pub mod memory;
pub mod store;

pub use cache::{ArtifactCache, CacheSettings, CachedArtifact, StoreRequest};
pub use entry::{ArtifactContext, CacheEntry};
pub use error::{Error, Result};
pub use file_index::JsonFileIndex;
pub use http_store::HttpObjectStore;
pub use key::{CacheKey, compute_hash};
pub use memory::{MemoryIndex, MemoryObjectStore};
pub use store::{BoxFuture, MetadataIndex, ObjectStore};
