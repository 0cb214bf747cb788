//! Content addressing: text + variant -> deterministic storage key

use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const HASH_HEX_LEN: usize = 32;

/// Deterministic hash of the trimmed content.
///
/// Leading and trailing whitespace does not change the hash; any other
/// difference does.
pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.trim().as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_HEX_LEN);
    hash
}

/// Identity of one artifact: content hash plus variant (e.g. language code).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub hash: String,
    pub variant: String,
}

impl CacheKey {
    pub fn new(content: &str, variant: &str) -> Self {
        Self {
            hash: compute_hash(content),
            variant: normalize_variant(variant),
        }
    }

    /// Object key `{prefix}/{hash}-{variant}.{extension}`.
    pub fn storage_key(&self, prefix: &str, extension: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let name = format!("{}-{}.{}", self.hash, self.variant, extension);
        if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        }
    }
}

/// Make the trimmed variant safe for use inside an object key.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `~XX` (uppercase hex), `~` included, so distinct variants never collide.
fn normalize_variant(variant: &str) -> String {
    let mut out = String::with_capacity(variant.len());
    for byte in variant.trim().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push('~');
            out.push_str(&hex::encode_upper([byte]));
        }
    }
    out
}
