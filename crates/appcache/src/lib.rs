//! # AppCache Engine
//!
//! An offline application cache: resources listed by a cache manifest are
//! downloaded into versioned caches that documents can be served from
//! without the network.
//!
//! ## Features
//!
//! - Update jobs with change detection, bounded concurrent downloads and
//!   manifest re-validation before publish
//! - Atomic publish of complete caches to memory or disk storage
//! - Master entries carried across upgrades
//! - Per-frontend batching of host notifications
//! - Offline lookup through explicit entries, fallback and network
//!   namespaces
//! - Automatic retry of transient update failures

pub mod builder;
pub mod config;
pub mod error;
pub mod model;
pub mod notifier;
pub mod service;
pub mod storage;
pub mod transport;
mod update;

#[cfg(test)]
mod testing;

pub use builder::AppCacheConfigBuilder;
pub use config::{AppCacheConfig, MANIFEST_MIME_TYPE, StorageConfig, TransportConfig, UpdateConfig};
pub use error::{AppCacheError, StorageError, TransportError, UpdateFailure};

pub use model::{
    BackendId, Cache, CacheId, Entry, EntryFlags, GroupId, HostId, HostKey, ResponseLookup,
    UpdateStatus,
};
pub use notifier::{AppCacheEvent, ErrorDetails, ErrorReason, EventId, FrontendSink, Status};
pub use service::{AppCacheBackend, AppCacheService, GroupSnapshot};
pub use storage::{CacheRecord, CacheStorage, FileStorage, MemoryStorage, StorageKey};
pub use transport::{FetchRequest, FetchResponse, HttpTransport, Transport, create_client};
pub use update::{JobStage, UpdateType};

// Re-export the manifest parser used by the engine
pub use cache_manifest::{Manifest, ManifestError, Namespace};
