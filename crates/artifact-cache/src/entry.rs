//! Metadata record describing a stored artifact

use serde::{Deserialize, Serialize};

/// Where an artifact was requested from, kept for browsing history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    /// e.g. "summary", "key-point-3", "word-selection"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl ArtifactContext {
    pub fn is_empty(&self) -> bool {
        self.page_id.is_none() && self.page_title.is_none() && self.section.is_none()
    }
}

/// Index record for one (content hash, variant) artifact.
///
/// `created_at` is a unix timestamp in milliseconds. `byte_size` is unknown
/// for records recovered from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: String,
    pub variant: String,
    pub storage_url: String,
    pub storage_key: String,
    #[serde(default)]
    pub byte_size: Option<u64>,
    pub created_at: u64,
    #[serde(default)]
    pub text_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ArtifactContext>,
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
