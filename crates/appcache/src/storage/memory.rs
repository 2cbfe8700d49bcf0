//! # Memory Storage
//!
//! Non-persistent storage backend. Used when no storage path is configured
//! and by the engine's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use super::{CacheRecord, CacheStorage, ResponseMetadata, StorageKey, StoredBody, check_quota};
use crate::error::{StorageError, StorageResult};
use crate::model::{CacheId, EntryFlags};

#[derive(Default)]
pub struct MemoryStorage {
    bodies: RwLock<HashMap<StorageKey, StoredBody>>,
    groups: RwLock<HashMap<Url, CacheRecord>>,
    sequence: AtomicU64,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: Option<u64>) -> Self {
        Self {
            quota,
            ..Default::default()
        }
    }

    /// Number of stored bodies.
    pub fn body_count(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn contains_body(&self, key: &StorageKey) -> bool {
        self.bodies.read().contains_key(key)
    }

    fn find_record(&self, cache_id: CacheId) -> Option<CacheRecord> {
        self.groups
            .read()
            .values()
            .find(|record| record.cache_id == cache_id)
            .cloned()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn read_entry_body(&self, key: &StorageKey) -> StorageResult<Option<StoredBody>> {
        Ok(self.bodies.read().get(key).cloned())
    }

    async fn write_entry_body(
        &self,
        url: &Url,
        data: Bytes,
        metadata: ResponseMetadata,
    ) -> StorageResult<StorageKey> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = StorageKey::derive(Some(url), &data, sequence);
        self.bodies.write().insert(key.clone(), (data, metadata));
        Ok(key)
    }

    async fn read_manifest_body(&self, cache_id: CacheId) -> StorageResult<Option<StoredBody>> {
        let Some(record) = self.find_record(cache_id) else {
            return Ok(None);
        };
        let Some(entry) = record.manifest_entry() else {
            return Err(StorageError::Corrupt(format!(
                "cache {cache_id} has no manifest entry"
            )));
        };
        self.read_entry_body(&entry.storage_key).await
    }

    async fn atomic_publish(&self, manifest_url: &Url, cache: &CacheRecord) -> StorageResult<()> {
        check_quota(self.quota, cache)?;
        {
            let bodies = self.bodies.read();
            if let Some(missing) = cache
                .entries
                .iter()
                .find(|e| !bodies.contains_key(&e.storage_key))
            {
                return Err(StorageError::NotFound(missing.storage_key.to_string()));
            }
        }
        self.groups
            .write()
            .insert(manifest_url.clone(), cache.clone());
        debug!(manifest_url = %manifest_url, cache_id = %cache.cache_id, "Published cache to memory storage");
        Ok(())
    }

    async fn load_group(&self, manifest_url: &Url) -> StorageResult<Option<CacheRecord>> {
        Ok(self.groups.read().get(manifest_url).cloned())
    }

    async fn make_group_obsolete(&self, manifest_url: &Url) -> StorageResult<()> {
        self.groups.write().remove(manifest_url);
        Ok(())
    }

    async fn mark_entry_foreign(&self, cache_id: CacheId, url: &Url) -> StorageResult<()> {
        let mut groups = self.groups.write();
        let entry = groups
            .values_mut()
            .filter(|record| record.cache_id == cache_id)
            .flat_map(|record| record.entries.iter_mut())
            .find(|entry| &entry.url == url);
        match entry {
            Some(entry) => {
                entry.flags |= EntryFlags::FOREIGN;
                Ok(())
            }
            None => Err(StorageError::NotFound(url.to_string())),
        }
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        self.bodies.write().remove(key);
        Ok(())
    }
}
