//! # Storage
//!
//! The durable side of the engine: response bodies addressed by
//! [`StorageKey`] and one published [`CacheRecord`] per group.

mod file;
mod memory;
mod types;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use types::{CacheRecord, EntryRecord, ResponseMetadata, StorageKey};

use crate::error::StorageResult;
use crate::model::CacheId;

/// A stored body together with the metadata it was written with.
pub type StoredBody = (Bytes, ResponseMetadata);

/// Storage backend used by the update engine.
///
/// Every method is a suspension point for the update job. Implementations
/// must make [`atomic_publish`](Self::atomic_publish) all-or-nothing: a
/// reader of [`load_group`](Self::load_group) sees either the previous
/// record or the new one.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Read a body previously written with `write_entry_body`.
    async fn read_entry_body(&self, key: &StorageKey) -> StorageResult<Option<StoredBody>>;

    /// Store a response body and return its key.
    async fn write_entry_body(
        &self,
        url: &Url,
        data: Bytes,
        metadata: ResponseMetadata,
    ) -> StorageResult<StorageKey>;

    /// Read the manifest body of a published cache.
    async fn read_manifest_body(&self, cache_id: CacheId) -> StorageResult<Option<StoredBody>>;

    /// Replace the group's published cache with `cache`.
    ///
    /// Fails with [`StorageError::QuotaExceeded`](crate::StorageError::QuotaExceeded)
    /// when the cache does not fit the configured quota; the previous record
    /// stays in place.
    async fn atomic_publish(&self, manifest_url: &Url, cache: &CacheRecord) -> StorageResult<()>;

    /// The most recently published cache of a group, if any.
    async fn load_group(&self, manifest_url: &Url) -> StorageResult<Option<CacheRecord>>;

    /// Drop a group's published record; bodies are deleted separately.
    async fn make_group_obsolete(&self, manifest_url: &Url) -> StorageResult<()>;

    /// Add the FOREIGN flag to one entry of a published cache.
    async fn mark_entry_foreign(&self, cache_id: CacheId, url: &Url) -> StorageResult<()>;

    /// Delete a body. Deleting a missing key is not an error.
    async fn delete(&self, key: &StorageKey) -> StorageResult<()>;
}

/// Quota check shared by the backends.
pub(crate) fn check_quota(
    quota: Option<u64>,
    cache: &CacheRecord,
) -> crate::error::StorageResult<()> {
    if let Some(quota) = quota {
        let used = cache.total_size();
        if used > quota {
            return Err(crate::StorageError::QuotaExceeded { used, quota });
        }
    }
    Ok(())
}
