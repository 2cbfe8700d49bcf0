use std::collections::{HashMap, HashSet};
use std::fmt;

use cache_manifest::{Manifest, Namespace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Entry, EntryFlags, GroupId, HostKey};
use crate::storage::{CacheRecord, EntryRecord, StorageKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheId(pub i64);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a request should be served from a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLookup {
    /// Serve the stored entry.
    Entry {
        cache_id: CacheId,
        url: Url,
        storage_key: StorageKey,
    },
    /// Go to the network, and serve the fallback entry if that fails.
    Fallback {
        cache_id: CacheId,
        namespace_url: Url,
        fallback_url: Url,
        storage_key: StorageKey,
    },
    /// Load from the network, bypassing the cache.
    Network,
    /// Respond with an error.
    NotFound,
}

/// One snapshot of resources built from a single manifest fetch.
///
/// Entries may only change while the cache is incomplete. Once complete the
/// only permitted mutation is adding the FOREIGN flag to an entry.
#[derive(Debug, Clone)]
pub struct Cache {
    id: CacheId,
    entries: HashMap<Url, Entry>,
    fallback_namespaces: Vec<Namespace>,
    online_whitelist_namespaces: Vec<Url>,
    online_whitelist_all: bool,
    is_complete: bool,
    update_time: DateTime<Utc>,
    /// Set while a group references this cache as newest, old or in progress.
    pub(crate) owning_group: Option<GroupId>,
    pub(crate) associated_hosts: HashSet<HostKey>,
}

impl Cache {
    pub fn new(id: CacheId) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            fallback_namespaces: Vec::new(),
            online_whitelist_namespaces: Vec::new(),
            online_whitelist_all: false,
            is_complete: false,
            update_time: Utc::now(),
            owning_group: None,
            associated_hosts: HashSet::new(),
        }
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn update_time(&self) -> DateTime<Utc> {
        self.update_time
    }

    pub fn owning_group(&self) -> Option<GroupId> {
        self.owning_group
    }

    pub fn associated_hosts(&self) -> impl Iterator<Item = &HostKey> {
        self.associated_hosts.iter()
    }

    pub fn has_hosts(&self) -> bool {
        !self.associated_hosts.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn get_entry(&self, url: &Url) -> Option<&Entry> {
        self.entries.get(url)
    }

    pub fn fallback_namespaces(&self) -> &[Namespace] {
        &self.fallback_namespaces
    }

    /// Add an entry, merging flags into an existing entry for the same URL.
    ///
    /// Returns `false` when the cache is already complete. When the URL is
    /// already present the stored body is kept and `entry.storage_key` is
    /// not referenced by the cache.
    pub fn add_or_merge_entry(&mut self, entry: Entry) -> bool {
        if self.is_complete {
            return false;
        }
        match self.entries.get_mut(&entry.url) {
            Some(existing) => existing.flags |= entry.flags,
            None => {
                self.entries.insert(entry.url.clone(), entry);
            }
        }
        true
    }

    /// OR `flags` into an existing entry of an incomplete cache.
    pub fn merge_entry_flags(&mut self, url: &Url, flags: EntryFlags) -> bool {
        if self.is_complete {
            return false;
        }
        match self.entries.get_mut(url) {
            Some(entry) => {
                entry.flags |= flags;
                true
            }
            None => false,
        }
    }

    pub fn mark_foreign(&mut self, url: &Url) -> bool {
        match self.entries.get_mut(url) {
            Some(entry) => {
                entry.flags |= EntryFlags::FOREIGN;
                true
            }
            None => false,
        }
    }

    pub fn initialize_with_manifest(&mut self, manifest: &Manifest) {
        if self.is_complete {
            return;
        }
        self.fallback_namespaces = manifest.fallback_namespaces.clone();
        self.online_whitelist_namespaces = manifest.online_whitelist_namespaces.clone();
        self.online_whitelist_all = manifest.online_whitelist_all;
    }

    /// Freeze the cache, stamping it with `update_time`.
    pub fn mark_complete(&mut self, update_time: DateTime<Utc>) {
        self.update_time = update_time;
        self.is_complete = true;
    }

    /// Every storage key the cache references.
    pub fn storage_keys(&self) -> Vec<StorageKey> {
        self.entries
            .values()
            .map(|entry| entry.storage_key.clone())
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    /// Decide how a request for `url` is served while offline.
    pub fn find_response(&self, url: &Url) -> ResponseLookup {
        let mut url = url.clone();
        url.set_fragment(None);

        if let Some(entry) = self.entries.get(&url).filter(|e| !e.is_foreign()) {
            return ResponseLookup::Entry {
                cache_id: self.id,
                url: entry.url.clone(),
                storage_key: entry.storage_key.clone(),
            };
        }

        if self
            .online_whitelist_namespaces
            .iter()
            .any(|ns| url.as_str().starts_with(ns.as_str()))
        {
            return ResponseLookup::Network;
        }

        let fallback = self
            .fallback_namespaces
            .iter()
            .filter(|ns| ns.is_match(&url))
            .max_by_key(|ns| ns.namespace_url.as_str().len());
        if let Some((ns, entry)) =
            fallback.and_then(|ns| self.entries.get(&ns.target_url).map(|entry| (ns, entry)))
        {
            return ResponseLookup::Fallback {
                cache_id: self.id,
                namespace_url: ns.namespace_url.clone(),
                fallback_url: ns.target_url.clone(),
                storage_key: entry.storage_key.clone(),
            };
        }

        if self.online_whitelist_all {
            return ResponseLookup::Network;
        }
        ResponseLookup::NotFound
    }

    pub fn to_record(&self, manifest_url: &Url) -> CacheRecord {
        let mut entries: Vec<EntryRecord> = self.entries.values().map(Into::into).collect();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        CacheRecord {
            cache_id: self.id,
            manifest_url: manifest_url.clone(),
            update_time: self.update_time,
            entries,
            fallback_namespaces: self.fallback_namespaces.clone(),
            online_whitelist_namespaces: self.online_whitelist_namespaces.clone(),
            online_whitelist_all: self.online_whitelist_all,
        }
    }

    /// Rebuild a complete cache from its published record.
    pub fn from_record(record: CacheRecord) -> Self {
        let entries = record
            .entries
            .into_iter()
            .map(|entry| (entry.url.clone(), Entry::from(entry)))
            .collect();
        Self {
            id: record.cache_id,
            entries,
            fallback_namespaces: record.fallback_namespaces,
            online_whitelist_namespaces: record.online_whitelist_namespaces,
            online_whitelist_all: record.online_whitelist_all,
            is_complete: true,
            update_time: record.update_time,
            owning_group: None,
            associated_hosts: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(s: &str, flags: EntryFlags) -> Entry {
        let u = url(s);
        let key = StorageKey::derive(Some(&u), s.as_bytes(), 0);
        Entry::new(u, flags, key, s.len() as u64)
    }

    fn offline_cache() -> Cache {
        let manifest = Manifest {
            explicit_urls: vec![url("http://example.com/a.js")],
            fallback_namespaces: vec![
                Namespace::new(url("http://example.com/"), url("http://example.com/offline.html")),
                Namespace::new(
                    url("http://example.com/docs/"),
                    url("http://example.com/docs-offline.html"),
                ),
            ],
            online_whitelist_namespaces: vec![url("http://example.com/api/")],
            online_whitelist_all: false,
        };
        let mut cache = Cache::new(CacheId(1));
        cache.initialize_with_manifest(&manifest);
        cache.add_or_merge_entry(entry("http://example.com/a.js", EntryFlags::EXPLICIT));
        cache.add_or_merge_entry(entry(
            "http://example.com/offline.html",
            EntryFlags::FALLBACK,
        ));
        cache.add_or_merge_entry(entry(
            "http://example.com/docs-offline.html",
            EntryFlags::FALLBACK,
        ));
        cache.mark_complete(Utc::now());
        cache
    }

    #[test]
    fn test_merge_flags_keeps_single_entry() {
        let mut cache = Cache::new(CacheId(1));
        let first = entry("http://example.com/index.html", EntryFlags::EXPLICIT);
        let first_key = first.storage_key.clone();
        assert!(cache.add_or_merge_entry(first));
        assert!(cache.add_or_merge_entry(entry(
            "http://example.com/index.html",
            EntryFlags::MASTER
        )));

        assert_eq!(cache.entry_count(), 1);
        let merged = cache.get_entry(&url("http://example.com/index.html")).unwrap();
        assert_eq!(merged.flags, EntryFlags::EXPLICIT | EntryFlags::MASTER);
        assert_eq!(merged.storage_key, first_key);
    }

    #[test]
    fn test_complete_cache_rejects_entries() {
        let mut cache = Cache::new(CacheId(1));
        cache.mark_complete(Utc::now());
        assert!(!cache.add_or_merge_entry(entry("http://example.com/a", EntryFlags::EXPLICIT)));
        assert!(!cache.merge_entry_flags(&url("http://example.com/a"), EntryFlags::MASTER));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_find_response_order() {
        let cache = offline_cache();

        assert!(matches!(
            cache.find_response(&url("http://example.com/a.js#frag")),
            ResponseLookup::Entry { .. }
        ));
        assert_eq!(
            cache.find_response(&url("http://example.com/api/user")),
            ResponseLookup::Network
        );
        match cache.find_response(&url("http://example.com/docs/intro.html")) {
            ResponseLookup::Fallback { fallback_url, .. } => {
                assert_eq!(fallback_url, url("http://example.com/docs-offline.html"));
            }
            other => panic!("unexpected lookup {other:?}"),
        }
        match cache.find_response(&url("http://example.com/other.html")) {
            ResponseLookup::Fallback { fallback_url, .. } => {
                assert_eq!(fallback_url, url("http://example.com/offline.html"));
            }
            other => panic!("unexpected lookup {other:?}"),
        }
        assert_eq!(
            cache.find_response(&url("http://elsewhere.com/x")),
            ResponseLookup::NotFound
        );
    }

    #[test]
    fn test_foreign_entry_is_not_served() {
        let mut cache = offline_cache();
        assert!(cache.mark_foreign(&url("http://example.com/a.js")));
        // Falls through to the root fallback namespace.
        assert!(matches!(
            cache.find_response(&url("http://example.com/a.js")),
            ResponseLookup::Fallback { .. }
        ));
    }

    #[test]
    fn test_record_roundtrip_preserves_lookup() {
        let cache = offline_cache();
        let record = cache.to_record(&url("http://example.com/app.appcache"));
        let restored = Cache::from_record(record);

        assert!(restored.is_complete());
        assert_eq!(restored.id(), cache.id());
        assert_eq!(restored.entry_count(), 3);
        assert_eq!(
            restored.find_response(&url("http://example.com/api/x")),
            ResponseLookup::Network
        );
    }
}
