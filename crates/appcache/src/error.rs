use std::sync::Arc;

use cache_manifest::ManifestError;
use url::Url;

use crate::notifier::{ErrorDetails, ErrorReason};

/// Failures reported by the transport collaborator.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Connection to {0} failed")]
    Connection(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// Manual implementation of From<reqwest::Error> for TransportError
// because of the Arc wrapping.
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let target = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if err.is_timeout() {
            TransportError::Timeout(target)
        } else if err.is_connect() {
            TransportError::Connection(target)
        } else {
            TransportError::Network {
                source: Arc::new(err),
            }
        }
    }
}

/// Failures reported by the storage collaborator.
#[derive(Debug, thiserror::Error, Clone)]
pub enum StorageError {
    #[error("Storage entry not found: {0}")]
    NotFound(String),
    #[error("Quota exceeded: {used} bytes required, quota is {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Corrupt storage record: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Why an update job ended in `CACHE_FAILURE`.
#[derive(Debug, thiserror::Error, Clone)]
pub enum UpdateFailure {
    #[error("Manifest fetch failed: {0}")]
    ManifestFetch(TransportError),
    #[error("Manifest fetch returned HTTP {status}")]
    ManifestStatus { status: u16 },
    #[error("Manifest has unexpected content type {0:?}")]
    ManifestMimeType(Option<String>),
    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] ManifestError),
    #[error("Manifest changed during update")]
    ManifestChanged,
    #[error("Resource fetch failed for {url}: {detail}")]
    ResourceFetch {
        url: Url,
        status: Option<u16>,
        detail: String,
    },
    #[error("Every master entry failed to download")]
    MasterEntriesFailed,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UpdateFailure {
    pub fn reason(&self) -> ErrorReason {
        match self {
            UpdateFailure::ManifestFetch(_)
            | UpdateFailure::ManifestStatus { .. }
            | UpdateFailure::ManifestMimeType(_) => ErrorReason::Manifest,
            UpdateFailure::ManifestParse(_) => ErrorReason::Signature,
            UpdateFailure::ManifestChanged => ErrorReason::Changed,
            UpdateFailure::ResourceFetch { .. } | UpdateFailure::MasterEntriesFailed => {
                ErrorReason::Resource
            }
            UpdateFailure::Storage(StorageError::QuotaExceeded { .. }) => ErrorReason::Quota,
            UpdateFailure::Storage(_) => ErrorReason::Unknown,
        }
    }

    /// Transient failures make the whole update eligible for a delayed retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateFailure::ManifestFetch(_) | UpdateFailure::ManifestStatus { status: 503 }
        )
    }

    pub fn details(&self, manifest_url: &Url) -> ErrorDetails {
        let (url, status) = match self {
            UpdateFailure::ResourceFetch { url, status, .. } => (url.clone(), *status),
            UpdateFailure::ManifestStatus { status } => (manifest_url.clone(), Some(*status)),
            _ => (manifest_url.clone(), None),
        };
        ErrorDetails {
            message: self.to_string(),
            reason: self.reason(),
            url: Some(url),
            status,
        }
    }
}

// Custom error type for service level operations
#[derive(Debug, thiserror::Error)]
pub enum AppCacheError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),
}
