//! # Storage Types
//!
//! Records and metadata shared by every storage backend.

use std::fmt;

use cache_manifest::Namespace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{CacheId, EntryFlags};

/// Opaque reference to a stored response body and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    /// Content-addressed key: `sha256(url, body)` plus a sequence suffix so
    /// that two writes of identical content never share a key.
    pub fn derive(url: Option<&Url>, data: &[u8], sequence: u64) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        if let Some(url) = url {
            hasher.update(url.as_str());
            hasher.update(b"\0");
        }
        hasher.update(data);

        let hash = hasher.finalize();
        Self(format!("{}-{sequence:x}", hex::encode(hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys are only ever produced by [`StorageKey::derive`]; anything else
    /// read back from disk is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let (hash, sequence) = raw.split_once('-')?;
        let valid = hash.len() == 64
            && hash.bytes().all(|b| b.is_ascii_hexdigit())
            && !sequence.is_empty()
            && sequence.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(raw.to_string()))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for a stored response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// When the response was stored (unix seconds)
    pub cached_at: u64,
    /// ETag value if available
    pub etag: Option<String>,
    /// Last-Modified header value if available
    pub last_modified: Option<String>,
    /// Content type of the response
    pub content_type: Option<String>,
    /// Location header of a redirect response
    pub location: Option<String>,
    /// Size of the body in bytes
    pub size: u64,
}

impl ResponseMetadata {
    /// Create new metadata for a body of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            cached_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            size,
            ..Default::default()
        }
    }

    pub fn with_etag_option(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified_option(mut self, last_modified: Option<String>) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_type_option(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_location_option(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// The media type without parameters, lowercased.
    pub fn mime_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

/// A stored entry of a published cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub url: Url,
    pub flags: EntryFlags,
    pub storage_key: StorageKey,
    pub size: u64,
}

/// Durable form of a complete cache, written by `atomic_publish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub cache_id: CacheId,
    pub manifest_url: Url,
    pub update_time: DateTime<Utc>,
    pub entries: Vec<EntryRecord>,
    #[serde(default)]
    pub fallback_namespaces: Vec<Namespace>,
    #[serde(default)]
    pub online_whitelist_namespaces: Vec<Url>,
    #[serde(default)]
    pub online_whitelist_all: bool,
}

impl CacheRecord {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn manifest_entry(&self) -> Option<&EntryRecord> {
        self.entries
            .iter()
            .find(|e| e.flags.contains(EntryFlags::MANIFEST))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_is_unique_per_sequence() {
        let url = Url::parse("http://example.com/a.js").unwrap();
        let a = StorageKey::derive(Some(&url), b"body", 1);
        let b = StorageKey::derive(Some(&url), b"body", 2);
        assert_ne!(a, b);
        assert_eq!(StorageKey::parse(a.as_str()), Some(a));
    }

    #[test]
    fn test_storage_key_parse_rejects_paths() {
        assert!(StorageKey::parse("../etc/passwd").is_none());
        assert!(StorageKey::parse("abc-1").is_none());
    }

    #[test]
    fn test_mime_type_strips_parameters() {
        let meta = ResponseMetadata::new(0).with_content_type("Text/Cache-Manifest; charset=utf-8");
        assert_eq!(meta.mime_type().as_deref(), Some("text/cache-manifest"));
        assert_eq!(ResponseMetadata::new(0).mime_type(), None);
    }
}
