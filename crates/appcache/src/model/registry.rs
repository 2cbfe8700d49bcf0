//! In-memory working set owned by the service: frontends, hosts, groups and
//! caches, addressed by id.
//!
//! A cache stays alive while a group references it (newest, old or in
//! progress) or at least one host is associated with it. Releasing the last
//! reference discards the cache and queues its bodies for deletion.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{BackendId, Cache, CacheId, Group, GroupId, Host, HostKey, UpdateStatus};
use crate::notifier::{FrontendSink, HostNotifier, Outbox, SinkMap, Status};
use crate::storage::CacheRecord;
use crate::update::JobState;

pub(crate) struct Registry {
    pub(crate) sinks: SinkMap,
    hosts: HashMap<HostKey, Host>,
    groups: HashMap<GroupId, Group>,
    groups_by_manifest: HashMap<Url, GroupId>,
    caches: HashMap<CacheId, Cache>,
    /// Consecutive transient failures per manifest.
    pub(crate) retry_attempts: HashMap<Url, u32>,
    /// Scheduled retries, cancelled by an explicit cancel or shutdown.
    pub(crate) retry_tokens: HashMap<Url, CancellationToken>,
    next_backend_id: u32,
    next_group_id: i64,
    next_cache_id: i64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            hosts: HashMap::new(),
            groups: HashMap::new(),
            groups_by_manifest: HashMap::new(),
            caches: HashMap::new(),
            retry_attempts: HashMap::new(),
            retry_tokens: HashMap::new(),
            next_backend_id: 1,
            next_group_id: 1,
            // Cache ids are persisted; start from the clock so ids from an
            // earlier run are not reused.
            next_cache_id: Utc::now().timestamp_micros().max(1),
        }
    }

    // --- Frontends and hosts ---

    pub(crate) fn add_backend(&mut self, sink: Arc<dyn FrontendSink>) -> BackendId {
        let id = BackendId(self.next_backend_id);
        self.next_backend_id += 1;
        self.sinks.insert(id, sink);
        id
    }

    pub(crate) fn remove_backend(&mut self, backend: BackendId, outbox: &mut Outbox) {
        let keys: Vec<HostKey> = self
            .hosts
            .keys()
            .filter(|key| key.backend == backend)
            .copied()
            .collect();
        for key in keys {
            self.remove_host(&key, outbox);
        }
        self.sinks.remove(&backend);
    }

    pub(crate) fn sink(&self, backend: BackendId) -> Option<Arc<dyn FrontendSink>> {
        self.sinks.get(&backend).cloned()
    }

    pub(crate) fn register_host(&mut self, key: HostKey) -> bool {
        if self.hosts.contains_key(&key) {
            return false;
        }
        self.hosts.insert(key, Host::new(key));
        true
    }

    pub(crate) fn host(&self, key: &HostKey) -> Option<&Host> {
        self.hosts.get(key)
    }

    pub(crate) fn host_mut(&mut self, key: &HostKey) -> Option<&mut Host> {
        self.hosts.get_mut(key)
    }

    /// Unassociate the host from its cache and drop it from any update job
    /// tracking it as a pending master entry.
    pub(crate) fn remove_host(&mut self, key: &HostKey, outbox: &mut Outbox) -> bool {
        if !self.hosts.contains_key(key) {
            return false;
        }
        self.associate_host(key, None, outbox);
        for group in self.groups.values_mut() {
            group.queued_masters.retain(|(queued, _)| queued != key);
            if let Some(job) = group.job.as_mut() {
                job.forget_host(key);
            }
        }
        let selected_group = self.hosts.remove(key).and_then(|host| host.selected_group);
        if let Some(group_id) = selected_group {
            self.collect_group(group_id);
        }
        true
    }

    /// Point the host at `cache`, releasing its previous cache.
    pub(crate) fn associate_host(
        &mut self,
        key: &HostKey,
        cache: Option<CacheId>,
        outbox: &mut Outbox,
    ) {
        let Some(host) = self.hosts.get_mut(key) else {
            return;
        };
        let previous = host.associated_cache;
        if previous == cache {
            return;
        }
        host.associated_cache = cache;

        if let Some(cache) = cache.and_then(|id| self.caches.get_mut(&id)) {
            cache.associated_hosts.insert(*key);
        }
        let Some(previous) = previous else {
            return;
        };
        let released = match self.caches.get_mut(&previous) {
            Some(old) => {
                old.associated_hosts.remove(key);
                !old.has_hosts()
            }
            None => false,
        };
        if released {
            self.release_cache(previous, outbox);
        }
    }

    /// Called when the last host leaves a cache.
    fn release_cache(&mut self, cache_id: CacheId, outbox: &mut Outbox) {
        let Some(group_id) = self.caches.get(&cache_id).and_then(Cache::owning_group) else {
            self.collect_cache(cache_id, outbox);
            return;
        };
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };

        let is_newest = group.newest_complete_cache() == Some(cache_id);
        let removable = group.contains_cache(cache_id) && (!is_newest || group.is_obsolete());
        if removable && group.remove_cache(cache_id) {
            if let Some(cache) = self.caches.get_mut(&cache_id) {
                cache.owning_group = None;
            }
            self.collect_cache(cache_id, outbox);
            self.collect_group(group_id);
        }
    }

    fn collect_cache(&mut self, cache_id: CacheId, outbox: &mut Outbox) {
        let unreferenced = self
            .caches
            .get(&cache_id)
            .is_some_and(|cache| cache.owning_group.is_none() && !cache.has_hosts());
        if !unreferenced {
            return;
        }
        if let Some(cache) = self.caches.remove(&cache_id) {
            debug!(cache_id = %cache_id, entries = cache.entry_count(), "Discarding cache");
            outbox.discard(cache.storage_keys());
        }
    }

    /// Forget a group once nothing refers to it anymore.
    pub(crate) fn collect_group(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if group.has_caches() || group.job.is_some() || group.update_status() != UpdateStatus::Idle
        {
            return;
        }
        if self
            .hosts
            .values()
            .any(|host| host.selected_group == Some(group_id))
        {
            return;
        }
        let manifest_url = group.manifest_url().clone();
        self.groups.remove(&group_id);
        if self.groups_by_manifest.get(&manifest_url) == Some(&group_id) {
            self.groups_by_manifest.remove(&manifest_url);
        }
        debug!(group = %group_id, manifest_url = %manifest_url, "Discarding group");
    }

    // --- Groups ---

    pub(crate) fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    /// The live group for a manifest. Obsolete groups are not returned.
    pub(crate) fn group_for_manifest(&self, manifest_url: &Url) -> Option<GroupId> {
        self.groups_by_manifest
            .get(manifest_url)
            .copied()
            .filter(|id| self.groups.get(id).is_some_and(|g| !g.is_obsolete()))
    }

    /// The most recent group for a manifest, obsolete or not.
    pub(crate) fn latest_group_for_manifest(&self, manifest_url: &Url) -> Option<GroupId> {
        self.groups_by_manifest.get(manifest_url).copied()
    }

    pub(crate) fn create_group(&mut self, manifest_url: &Url) -> GroupId {
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        self.groups.insert(id, Group::new(id, manifest_url.clone()));
        self.groups_by_manifest.insert(manifest_url.clone(), id);
        debug!(group = %id, manifest_url = %manifest_url, "Created group");
        id
    }

    /// Create a group whose newest cache is restored from storage.
    pub(crate) fn restore_group(&mut self, record: CacheRecord) -> GroupId {
        let manifest_url = record.manifest_url.clone();
        let group_id = self.create_group(&manifest_url);
        let cache = Cache::from_record(record);
        let cache_id = cache.id();
        self.next_cache_id = self.next_cache_id.max(cache_id.0 + 1);
        self.caches.insert(cache_id, cache);
        self.add_cache_to_group(group_id, cache_id, &mut Outbox::default());
        group_id
    }

    pub(crate) fn make_group_obsolete(&mut self, group_id: GroupId) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.set_obsolete();
        }
    }

    /// Hand a complete cache to its group. A demoted cache nobody uses is
    /// dropped right away.
    pub(crate) fn add_cache_to_group(
        &mut self,
        group_id: GroupId,
        cache_id: CacheId,
        outbox: &mut Outbox,
    ) {
        let Some(cache) = self.caches.get_mut(&cache_id) else {
            return;
        };
        cache.owning_group = Some(group_id);
        let update_time = cache.update_time();
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        let Some(demoted) = group.add_cache(cache_id, update_time) else {
            return;
        };
        let unused = self
            .caches
            .get(&demoted)
            .is_some_and(|cache| !cache.has_hosts());
        if unused {
            self.release_cache(demoted, outbox);
        }
    }

    /// Drop a cache that will never be published. Its hosts move to
    /// `reassociate_to`.
    pub(crate) fn discard_cache(
        &mut self,
        cache_id: CacheId,
        reassociate_to: Option<CacheId>,
        outbox: &mut Outbox,
    ) {
        let Some(cache) = self.caches.get_mut(&cache_id) else {
            return;
        };
        cache.owning_group = None;
        let hosts: Vec<HostKey> = cache.associated_hosts.iter().copied().collect();
        for key in &hosts {
            self.associate_host(key, reassociate_to, outbox);
        }
        self.collect_cache(cache_id, outbox);
    }

    // --- Caches ---

    pub(crate) fn cache(&self, id: CacheId) -> Option<&Cache> {
        self.caches.get(&id)
    }

    pub(crate) fn cache_mut(&mut self, id: CacheId) -> Option<&mut Cache> {
        self.caches.get_mut(&id)
    }

    /// Create an incomplete cache owned by an update of `group_id`.
    pub(crate) fn new_cache(&mut self, group_id: GroupId) -> CacheId {
        let id = CacheId(self.next_cache_id);
        self.next_cache_id += 1;
        let mut cache = Cache::new(id);
        cache.owning_group = Some(group_id);
        self.caches.insert(id, cache);
        id
    }

    // --- Status ---

    pub(crate) fn host_status(&self, key: &HostKey) -> Option<Status> {
        let host = self.hosts.get(key)?;
        let Some(cache) = host.associated_cache.and_then(|id| self.caches.get(&id)) else {
            return Some(Status::Uncached);
        };
        // Only the cache under construction is incomplete.
        if !cache.is_complete() {
            return Some(Status::Downloading);
        }
        let Some(group) = cache.owning_group().and_then(|id| self.groups.get(&id)) else {
            return Some(Status::Idle);
        };
        if group.is_obsolete() {
            return Some(Status::Obsolete);
        }
        let status = match group.update_status() {
            UpdateStatus::Checking => Status::Checking,
            UpdateStatus::Downloading => Status::Downloading,
            UpdateStatus::Idle => match group.newest_complete_cache() {
                Some(newest) if newest != cache.id() => Status::UpdateReady,
                _ => Status::Idle,
            },
        };
        Some(status)
    }

    /// Move the host to its group's newest cache, or to no cache when the
    /// group is obsolete.
    pub(crate) fn swap_cache(&mut self, key: &HostKey, outbox: &mut Outbox) -> bool {
        let Some(cache) = self
            .hosts
            .get(key)
            .and_then(|host| host.associated_cache)
            .and_then(|id| self.caches.get(&id))
            .filter(|cache| cache.is_complete())
        else {
            return false;
        };
        let cache_id = cache.id();
        let Some(group) = cache.owning_group().and_then(|id| self.groups.get(&id)) else {
            return false;
        };
        let (is_obsolete, newest) = (group.is_obsolete(), group.newest_complete_cache());

        if is_obsolete {
            self.associate_host(key, None, outbox);
            return true;
        }
        match newest {
            Some(newest) if newest != cache_id => {
                self.associate_host(key, Some(newest), outbox);
                true
            }
            _ => false,
        }
    }

    /// Hosts associated with any cache of the group, including the cache an
    /// update is building.
    pub(crate) fn associated_hosts(&self, group_id: GroupId) -> HostNotifier {
        let mut notifier = HostNotifier::new();
        for cache in self
            .caches
            .values()
            .filter(|cache| cache.owning_group() == Some(group_id))
        {
            notifier.add_many(cache.associated_hosts());
        }
        notifier
    }

    pub(crate) fn pending_master_hosts(&self, group_id: GroupId) -> HostNotifier {
        let mut notifier = HostNotifier::new();
        if let Some(job) = self.groups.get(&group_id).and_then(|g| g.job.as_ref()) {
            notifier.add_many(job.pending_master_entries.values().flatten());
        }
        notifier
    }

    /// Associated and pending-master hosts, each once.
    pub(crate) fn all_hosts(&self, group_id: GroupId) -> HostNotifier {
        let mut notifier = self.associated_hosts(group_id);
        if let Some(job) = self.groups.get(&group_id).and_then(|g| g.job.as_ref()) {
            notifier.add_many(job.pending_master_entries.values().flatten());
        }
        notifier
    }

    /// Tell every associated host its recomputed status.
    pub(crate) fn notify_status_changed(&self, group_id: GroupId, outbox: &mut Outbox) {
        let mut by_status: HashMap<Status, HostNotifier> = HashMap::new();
        for cache in self
            .caches
            .values()
            .filter(|cache| cache.owning_group() == Some(group_id))
        {
            for key in cache.associated_hosts() {
                if let Some(status) = self.host_status(key) {
                    by_status.entry(status).or_default().add(*key);
                }
            }
        }
        for (status, notifier) in by_status {
            notifier.send_status(&self.sinks, status, outbox);
        }
    }

    pub(crate) fn job(&self, group_id: GroupId) -> Option<&JobState> {
        self.groups.get(&group_id).and_then(|g| g.job.as_ref())
    }

    pub(crate) fn job_mut(&mut self, group_id: GroupId) -> Option<&mut JobState> {
        self.groups.get_mut(&group_id).and_then(|g| g.job.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, EntryFlags, HostId};
    use crate::storage::StorageKey;
    use crate::testing::RecordingSink;

    fn manifest_url() -> Url {
        Url::parse("http://example.com/app.appcache").unwrap()
    }

    fn complete_cache(registry: &mut Registry, group: GroupId, body: &str) -> CacheId {
        let id = registry.new_cache(group);
        let cache = registry.cache_mut(id).unwrap();
        let url = Url::parse("http://example.com/a.js").unwrap();
        let key = StorageKey::derive(Some(&url), body.as_bytes(), id.0 as u64);
        cache.add_or_merge_entry(Entry::new(url, EntryFlags::EXPLICIT, key, body.len() as u64));
        cache.mark_complete(Utc::now());
        id
    }

    fn setup() -> (Registry, BackendId) {
        let mut registry = Registry::new();
        let backend = registry.add_backend(Arc::new(RecordingSink::default()));
        (registry, backend)
    }

    #[test]
    fn test_old_cache_released_when_last_host_swaps() {
        let (mut registry, backend) = setup();
        let group = registry.create_group(&manifest_url());
        let host = HostKey::new(backend, HostId(1));
        registry.register_host(host);

        let first = complete_cache(&mut registry, group, "v1");
        let mut outbox = Outbox::default();
        registry.add_cache_to_group(group, first, &mut outbox);
        registry.associate_host(&host, Some(first), &mut outbox);

        let second = complete_cache(&mut registry, group, "v2");
        registry.add_cache_to_group(group, second, &mut outbox);
        assert_eq!(registry.host_status(&host), Some(Status::UpdateReady));
        // Still in use, so it stays as an old cache.
        assert!(registry.cache(first).is_some());

        assert!(registry.swap_cache(&host, &mut outbox));
        assert_eq!(registry.host_status(&host), Some(Status::Idle));
        assert!(registry.cache(first).is_none());
        assert_eq!(registry.group(group).unwrap().old_caches().count(), 0);
        assert_eq!(outbox.garbage_len(), 1);
        assert!(!registry.swap_cache(&host, &mut outbox));
    }

    #[test]
    fn test_unused_demoted_cache_is_dropped() {
        let (mut registry, _) = setup();
        let group = registry.create_group(&manifest_url());
        let mut outbox = Outbox::default();
        let first = complete_cache(&mut registry, group, "v1");
        registry.add_cache_to_group(group, first, &mut outbox);
        let second = complete_cache(&mut registry, group, "v2");
        registry.add_cache_to_group(group, second, &mut outbox);

        assert!(registry.cache(first).is_none());
        assert_eq!(
            registry.group(group).unwrap().newest_complete_cache(),
            Some(second)
        );
    }

    #[test]
    fn test_discarded_cache_moves_hosts() {
        let (mut registry, backend) = setup();
        let group = registry.create_group(&manifest_url());
        let host = HostKey::new(backend, HostId(1));
        registry.register_host(host);
        let mut outbox = Outbox::default();

        let newest = complete_cache(&mut registry, group, "v1");
        registry.add_cache_to_group(group, newest, &mut outbox);
        let inprogress = registry.new_cache(group);
        registry.associate_host(&host, Some(inprogress), &mut outbox);
        assert_eq!(registry.host_status(&host), Some(Status::Downloading));

        registry.discard_cache(inprogress, Some(newest), &mut outbox);
        assert!(registry.cache(inprogress).is_none());
        assert_eq!(registry.host(&host).unwrap().associated_cache, Some(newest));
    }

    #[test]
    fn test_remove_host_collects_unreferenced_group() {
        let (mut registry, backend) = setup();
        let group = registry.create_group(&manifest_url());
        let host = HostKey::new(backend, HostId(1));
        registry.register_host(host);
        registry.host_mut(&host).unwrap().selected_group = Some(group);

        registry.collect_group(group);
        assert!(registry.group(group).is_some());

        assert!(registry.remove_host(&host, &mut Outbox::default()));
        assert!(registry.group(group).is_none());
        assert!(registry.group_for_manifest(&manifest_url()).is_none());
        assert!(!registry.remove_host(&host, &mut Outbox::default()));
    }

    #[test]
    fn test_obsolete_group_is_hidden_from_lookup() {
        let (mut registry, _) = setup();
        let group = registry.create_group(&manifest_url());
        registry.make_group_obsolete(group);
        assert!(registry.group_for_manifest(&manifest_url()).is_none());
        assert_eq!(
            registry.latest_group_for_manifest(&manifest_url()),
            Some(group)
        );
    }
}
