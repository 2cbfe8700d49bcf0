//! # File Storage
//!
//! Persistent storage backend. Bodies live under `bodies/` as a data file
//! plus a `.meta` JSON sidecar; every group's published cache is a single
//! JSON record under `groups/`, replaced by rename so that publishing is
//! atomic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};
use url::Url;

use super::{CacheRecord, CacheStorage, ResponseMetadata, StorageKey, StoredBody, check_quota};
use crate::error::{StorageError, StorageResult};
use crate::model::{CacheId, EntryFlags};

const BODIES_DIR: &str = "bodies";
const GROUPS_DIR: &str = "groups";

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    initialized: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    quota: Option<u64>,
}

impl FileStorage {
    /// Create a file storage rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>, quota: Option<u64>) -> Self {
        // Seeded from the clock so keys stay unique across restarts.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            root: root.into(),
            initialized: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(seed)),
            quota,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initialize the storage directories
    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        // Fast path - already initialized
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        fs::create_dir_all(self.root.join(BODIES_DIR)).await?;
        fs::create_dir_all(self.root.join(GROUPS_DIR)).await?;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn body_path(&self, key: &StorageKey) -> PathBuf {
        self.root.join(BODIES_DIR).join(key.as_str())
    }

    fn metadata_path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.body_path(key);
        path.set_extension("meta");
        path
    }

    fn group_path(&self, manifest_url: &Url) -> PathBuf {
        use sha2::{Digest, Sha256};

        let hash = Sha256::digest(manifest_url.as_str().as_bytes());
        self.root
            .join(GROUPS_DIR)
            .join(format!("{}.json", hex::encode(hash)))
    }

    /// Write `data` to `path` through a temporary file and a rename.
    async fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
        let temp_path = path.with_extension("tmp");

        if let Err(e) = fs::write(&temp_path, data).await {
            warn!(path = ?temp_path, error = %e, "Failed to write temporary file");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path).await {
            warn!(
                from = ?temp_path,
                to = ?path,
                error = %e,
                "Failed to rename temporary file"
            );
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        Ok(())
    }

    async fn read_record(path: &Path) -> StorageResult<Option<CacheRecord>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => Err(StorageError::Corrupt(format!("{}: {e}", path.display()))),
        }
    }

    /// Scan every group record for the one holding `cache_id`.
    async fn find_record(&self, cache_id: CacheId) -> StorageResult<Option<(PathBuf, CacheRecord)>> {
        self.ensure_initialized().await?;

        let mut entries = fs::read_dir(self.root.join(GROUPS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) if record.cache_id == cache_id => {
                    return Ok(Some((path, record)));
                }
                Ok(_) => {}
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable group record"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn read_entry_body(&self, key: &StorageKey) -> StorageResult<Option<StoredBody>> {
        self.ensure_initialized().await?;

        let data_path = self.body_path(key);
        let meta_path = self.metadata_path(key);

        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: ResponseMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", meta_path.display())))?;

        let data = match fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = ?data_path, "Body missing for existing metadata");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some((Bytes::from(data), metadata)))
    }

    async fn write_entry_body(
        &self,
        url: &Url,
        data: Bytes,
        metadata: ResponseMetadata,
    ) -> StorageResult<StorageKey> {
        self.ensure_initialized().await?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = StorageKey::derive(Some(url), &data, sequence);
        let metadata_json = serde_json::to_vec(&metadata)?;

        // Data first: a body without metadata reads back as missing.
        Self::write_atomically(&self.body_path(&key), &data).await?;
        if let Err(e) = Self::write_atomically(&self.metadata_path(&key), &metadata_json).await {
            let _ = fs::remove_file(self.body_path(&key)).await;
            return Err(e.into());
        }

        debug!(key = %key, url = %url, size = data.len(), "Stored entry body");
        Ok(key)
    }

    async fn read_manifest_body(&self, cache_id: CacheId) -> StorageResult<Option<StoredBody>> {
        let Some((_, record)) = self.find_record(cache_id).await? else {
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
        self.ensure_initialized().await?;
        check_quota(self.quota, cache)?;

        for entry in &cache.entries {
            if !fs::try_exists(self.metadata_path(&entry.storage_key)).await? {
                return Err(StorageError::NotFound(entry.storage_key.to_string()));
            }
        }

        let json = serde_json::to_vec_pretty(cache)?;
        Self::write_atomically(&self.group_path(manifest_url), &json).await?;

        debug!(manifest_url = %manifest_url, cache_id = %cache.cache_id, "Published cache record");
        Ok(())
    }

    async fn load_group(&self, manifest_url: &Url) -> StorageResult<Option<CacheRecord>> {
        self.ensure_initialized().await?;
        Self::read_record(&self.group_path(manifest_url)).await
    }

    async fn make_group_obsolete(&self, manifest_url: &Url) -> StorageResult<()> {
        self.ensure_initialized().await?;
        match fs::remove_file(self.group_path(manifest_url)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_entry_foreign(&self, cache_id: CacheId, url: &Url) -> StorageResult<()> {
        let Some((path, mut record)) = self.find_record(cache_id).await? else {
            return Err(StorageError::NotFound(format!("cache {cache_id}")));
        };
        let Some(entry) = record.entries.iter_mut().find(|e| &e.url == url) else {
            return Err(StorageError::NotFound(url.to_string()));
        };
        entry.flags |= EntryFlags::FOREIGN;

        let json = serde_json::to_vec_pretty(&record)?;
        Self::write_atomically(&path, &json).await?;
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        self.ensure_initialized().await?;

        let data_result = fs::remove_file(self.body_path(key)).await;
        let meta_result = fs::remove_file(self.metadata_path(key)).await;

        // We don't care if the files don't exist
        match (data_result, meta_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(key = %key, error = %e, "Failed to remove body file");
                Err(e.into())
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(key = %key, error = %e, "Failed to remove metadata file");
                Err(e.into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryRecord;
    use chrono::Utc;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn publish_simple(storage: &FileStorage, cache_id: i64, body: &'static [u8]) -> CacheRecord {
        let manifest_url = url("http://example.com/app.appcache");
        let key = storage
            .write_entry_body(
                &manifest_url,
                Bytes::from_static(body),
                ResponseMetadata::new(body.len() as u64).with_content_type("text/cache-manifest"),
            )
            .await
            .unwrap();
        let record = CacheRecord {
            cache_id: CacheId(cache_id),
            manifest_url: manifest_url.clone(),
            update_time: Utc::now(),
            entries: vec![EntryRecord {
                url: manifest_url.clone(),
                flags: EntryFlags::MANIFEST,
                storage_key: key,
                size: body.len() as u64,
            }],
            fallback_namespaces: Vec::new(),
            online_whitelist_namespaces: Vec::new(),
            online_whitelist_all: false,
        };
        storage.atomic_publish(&manifest_url, &record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_body_roundtrip_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), None);

        let key = storage
            .write_entry_body(
                &url("http://example.com/a.css"),
                Bytes::from_static(b"body{}"),
                ResponseMetadata::new(6).with_content_type("text/css"),
            )
            .await
            .unwrap();

        let (data, meta) = storage.read_entry_body(&key).await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"body{}"));
        assert_eq!(meta.content_type.as_deref(), Some("text/css"));

        storage.delete(&key).await.unwrap();
        assert!(storage.read_entry_body(&key).await.unwrap().is_none());
        storage.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let record = {
            let storage = FileStorage::new(dir.path(), None);
            publish_simple(&storage, 11, b"CACHE MANIFEST\na.js\n").await
        };

        let reopened = FileStorage::new(dir.path(), None);
        let loaded = reopened
            .load_group(&record.manifest_url)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);

        let (manifest, _) = reopened
            .read_manifest_body(CacheId(11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest, Bytes::from_static(b"CACHE MANIFEST\na.js\n"));
    }

    #[tokio::test]
    async fn test_republish_replaces_record() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), None);
        publish_simple(&storage, 1, b"CACHE MANIFEST\n# v1\n").await;
        let second = publish_simple(&storage, 2, b"CACHE MANIFEST\n# v2\n").await;

        let loaded = storage
            .load_group(&second.manifest_url)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.cache_id, CacheId(2));
        assert!(storage.read_manifest_body(CacheId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_and_obsolete() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), Some(4));
        let manifest_url = url("http://example.com/app.appcache");
        let key = storage
            .write_entry_body(&manifest_url, Bytes::from_static(b"too large"), ResponseMetadata::new(9))
            .await
            .unwrap();
        let record = CacheRecord {
            cache_id: CacheId(5),
            manifest_url: manifest_url.clone(),
            update_time: Utc::now(),
            entries: vec![EntryRecord {
                url: manifest_url.clone(),
                flags: EntryFlags::MANIFEST,
                storage_key: key,
                size: 9,
            }],
            fallback_namespaces: Vec::new(),
            online_whitelist_namespaces: Vec::new(),
            online_whitelist_all: false,
        };

        assert!(matches!(
            storage.atomic_publish(&manifest_url, &record).await,
            Err(StorageError::QuotaExceeded { .. })
        ));
        assert!(storage.load_group(&manifest_url).await.unwrap().is_none());
        // Obsoleting a group with no record is a no-op.
        storage.make_group_obsolete(&manifest_url).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_entry_foreign_rewrites_record() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), None);
        let record = publish_simple(&storage, 4, b"CACHE MANIFEST\n").await;

        storage
            .mark_entry_foreign(CacheId(4), &record.manifest_url)
            .await
            .unwrap();
        let loaded = storage
            .load_group(&record.manifest_url)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.entries[0].flags.contains(EntryFlags::FOREIGN));
    }
}
