//! # Service
//!
//! [`AppCacheService`] owns the working set (frontends, hosts, groups and
//! caches) together with the storage and transport collaborators. Frontends
//! talk to it through an [`AppCacheBackend`], which scopes host ids and
//! carries the frontend's notification sink.
//!
//! State transitions happen under one lock and never across a suspension
//! point. Notifications produced by a transition are delivered after the
//! lock is released.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppCacheConfig;
use crate::error::AppCacheError;
use crate::model::{
    BackendId, Cache, CacheId, GroupId, HostId, HostKey, Registry, ResponseLookup, UpdateStatus,
};
use crate::notifier::{FrontendSink, Outbox, Status};
use crate::storage::{CacheStorage, FileStorage, MemoryStorage, StorageKey, StoredBody};
use crate::transport::{HttpTransport, Transport};
use crate::update::{self, JobStage, StartOutcome};

pub(crate) struct ServiceInner {
    pub(crate) config: AppCacheConfig,
    pub(crate) storage: Arc<dyn CacheStorage>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Mutex<Registry>,
    /// Parent of every job and retry token.
    pub(crate) shutdown: CancellationToken,
}

impl ServiceInner {
    /// The live group for `manifest_url`, restoring it from storage or
    /// creating an empty one.
    async fn ensure_group(&self, manifest_url: &Url) -> Result<GroupId, AppCacheError> {
        if let Some(group_id) = self.registry.lock().group_for_manifest(manifest_url) {
            return Ok(group_id);
        }

        let record = self.storage.load_group(manifest_url).await?;

        let mut registry = self.registry.lock();
        if let Some(group_id) = registry.group_for_manifest(manifest_url) {
            return Ok(group_id);
        }
        // A record left behind by a group that just became obsolete is not
        // brought back.
        let replacing_obsolete = registry.latest_group_for_manifest(manifest_url).is_some();
        let group_id = match record {
            Some(record) if !replacing_obsolete => {
                info!(
                    manifest_url = %manifest_url,
                    cache_id = %record.cache_id,
                    "Restored group from storage"
                );
                registry.restore_group(record)
            }
            _ => registry.create_group(manifest_url),
        };
        Ok(group_id)
    }

    /// Start an update of `group_id` on behalf of `host`, or join the one
    /// running. Returns `false` if the group cannot be updated.
    async fn run_update(
        self: &Arc<Self>,
        group_id: GroupId,
        host: Option<HostKey>,
        new_master: Option<Url>,
        mut outbox: Outbox,
    ) -> bool {
        let outcome = {
            let mut registry = self.registry.lock();
            update::start_update(self, &mut registry, group_id, host, new_master, &mut outbox)
        };
        outbox.flush(self.storage.as_ref()).await;
        finish_start(outcome)
    }

    async fn update_manifest(self: &Arc<Self>, manifest_url: &Url) -> Result<bool, AppCacheError> {
        let group_id = self.ensure_group(manifest_url).await?;
        Ok(self
            .run_update(group_id, None, None, Outbox::default())
            .await)
    }

    /// Re-run the update of `manifest_url` after `delay`, unless cancelled
    /// first.
    pub(crate) fn schedule_retry(self: &Arc<Self>, manifest_url: Url, delay: Duration) {
        let token = self.shutdown.child_token();
        let previous = self
            .registry
            .lock()
            .retry_tokens
            .insert(manifest_url.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(manifest_url = %manifest_url, "Retry cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    inner.registry.lock().retry_tokens.remove(&manifest_url);
                    info!(manifest_url = %manifest_url, "Retrying update");
                    if let Err(e) = inner.update_manifest(&manifest_url).await {
                        warn!(manifest_url = %manifest_url, error = %e, "Retry could not start");
                    }
                }
            }
        });
    }
}

fn finish_start(outcome: StartOutcome) -> bool {
    match outcome {
        StartOutcome::Started(job) => {
            job.spawn();
            true
        }
        StartOutcome::Joined => true,
        StartOutcome::Rejected => false,
    }
}

/// Point-in-time view of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    pub manifest_url: Url,
    pub newest_cache: Option<CacheId>,
    pub old_caches: Vec<CacheId>,
    pub update_status: UpdateStatus,
    pub is_obsolete: bool,
    /// Stage of the running update, if any.
    pub stage: Option<JobStage>,
}

/// The application cache engine.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct AppCacheService {
    inner: Arc<ServiceInner>,
}

impl AppCacheService {
    pub fn new(
        config: AppCacheConfig,
        storage: Arc<dyn CacheStorage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                storage,
                transport,
                registry: Mutex::new(Registry::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build a service with an HTTP transport and the storage named by the
    /// configuration: on disk when a path is set, in memory otherwise.
    pub fn with_http(config: AppCacheConfig) -> Result<Self, AppCacheError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.transport)?);
        let storage: Arc<dyn CacheStorage> = match &config.storage.path {
            Some(path) => Arc::new(FileStorage::new(path.clone(), config.storage.group_quota)),
            None => Arc::new(MemoryStorage::with_quota(config.storage.group_quota)),
        };
        Ok(Self::new(config, storage, transport))
    }

    pub fn config(&self) -> &AppCacheConfig {
        &self.inner.config
    }

    /// Register a frontend. Its hosts are reported to `sink`.
    pub fn register_backend(&self, sink: Arc<dyn FrontendSink>) -> AppCacheBackend {
        let id = self.inner.registry.lock().add_backend(sink);
        debug!(backend = id.0, "Registered backend");
        AppCacheBackend {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Check `manifest_url` for an update without any host. Returns `false`
    /// if the group is obsolete.
    pub async fn update_group(&self, manifest_url: &Url) -> Result<bool, AppCacheError> {
        self.inner.update_manifest(manifest_url).await
    }

    /// Wait until the group of `manifest_url` has no update running.
    pub async fn wait_for_idle(&self, manifest_url: &Url) {
        let receiver = {
            let registry = self.inner.registry.lock();
            registry
                .latest_group_for_manifest(manifest_url)
                .and_then(|id| registry.group(id))
                .map(|group| group.subscribe())
        };
        if let Some(mut receiver) = receiver {
            // The sender lives as long as the job; a closed channel means the
            // job is gone.
            let _ = receiver
                .wait_for(|status| *status == UpdateStatus::Idle)
                .await;
        }
    }

    pub fn group_snapshot(&self, manifest_url: &Url) -> Option<GroupSnapshot> {
        let registry = self.inner.registry.lock();
        let group_id = registry.latest_group_for_manifest(manifest_url)?;
        let group = registry.group(group_id)?;
        Some(GroupSnapshot {
            group_id,
            manifest_url: group.manifest_url().clone(),
            newest_cache: group.newest_complete_cache(),
            old_caches: group.old_caches().collect(),
            update_status: group.update_status(),
            is_obsolete: group.is_obsolete(),
            stage: group.job.as_ref().map(|job| job.stage),
        })
    }

    pub fn cache_snapshot(&self, cache_id: CacheId) -> Option<Cache> {
        self.inner.registry.lock().cache(cache_id).cloned()
    }

    /// How `url` would be served from the newest cache of `manifest_url`,
    /// restoring the group from storage if needed. `None` if the group has
    /// no complete cache.
    pub async fn lookup(
        &self,
        manifest_url: &Url,
        url: &Url,
    ) -> Result<Option<ResponseLookup>, AppCacheError> {
        let group_id = self.inner.ensure_group(manifest_url).await?;
        let registry = self.inner.registry.lock();
        Ok(registry
            .group(group_id)
            .and_then(|group| group.newest_complete_cache())
            .and_then(|id| registry.cache(id))
            .map(|cache| cache.find_response(url)))
    }

    pub async fn read_body(&self, key: &StorageKey) -> Result<Option<StoredBody>, AppCacheError> {
        Ok(self.inner.storage.read_entry_body(key).await?)
    }

    /// Cancel the running update of `manifest_url` and any pending retry.
    /// Hosts receive no further events for the cancelled job.
    pub fn cancel_update(&self, manifest_url: &Url) -> bool {
        let mut registry = self.inner.registry.lock();
        let mut cancelled = false;
        if let Some(token) = registry.retry_tokens.remove(manifest_url) {
            token.cancel();
            cancelled = true;
        }
        registry.retry_attempts.remove(manifest_url);
        let job = registry
            .latest_group_for_manifest(manifest_url)
            .and_then(|id| registry.job(id));
        if let Some(job) = job {
            job.cancel.cancel();
            cancelled = true;
        }
        if cancelled {
            info!(manifest_url = %manifest_url, "Cancelled update");
        }
        cancelled
    }

    /// Cancel every running update and pending retry.
    pub fn shutdown(&self) {
        info!("Shutting down application cache service");
        self.inner.shutdown.cancel();
    }
}

/// A frontend's handle on the service. Host ids are scoped to the backend.
pub struct AppCacheBackend {
    id: BackendId,
    inner: Arc<ServiceInner>,
}

impl AppCacheBackend {
    pub fn id(&self) -> BackendId {
        self.id
    }

    fn key(&self, host_id: HostId) -> HostKey {
        HostKey::new(self.id, host_id)
    }

    /// Returns `false` if the id is already registered.
    pub fn register_host(&self, host_id: HostId) -> bool {
        self.inner.registry.lock().register_host(self.key(host_id))
    }

    /// Returns `false` if the host is unknown.
    pub async fn unregister_host(&self, host_id: HostId) -> bool {
        let mut outbox = Outbox::default();
        let removed = self
            .inner
            .registry
            .lock()
            .remove_host(&self.key(host_id), &mut outbox);
        outbox.flush(self.inner.storage.as_ref()).await;
        removed
    }

    /// Choose the cache a freshly loaded document uses.
    ///
    /// With `prior_cache` the document was loaded from that cache and stays
    /// on it. With `manifest_url` the document joins the manifest's group
    /// and is added to it as a master entry. A host selects once.
    pub async fn select_cache(
        &self,
        host_id: HostId,
        document_url: &Url,
        prior_cache: Option<CacheId>,
        manifest_url: Option<&Url>,
    ) -> bool {
        let key = self.key(host_id);
        {
            let mut registry = self.inner.registry.lock();
            let Some(host) = registry.host_mut(&key) else {
                return false;
            };
            if host.selection_made {
                warn!(host = %key, "Cache already selected");
                return false;
            }
            host.selection_made = true;
            host.document_url = Some(document_url.clone());
        }

        if let Some(cache_id) = prior_cache {
            return self.select_existing_cache(key, cache_id).await;
        }

        let Some(manifest_url) = manifest_url else {
            self.select_no_cache(key).await;
            return true;
        };
        if manifest_url.origin() != document_url.origin() {
            debug!(host = %key, manifest_url = %manifest_url, "Cross-origin manifest ignored");
            self.select_no_cache(key).await;
            return true;
        }

        let group_id = match self.inner.ensure_group(manifest_url).await {
            Ok(group_id) => group_id,
            Err(e) => {
                warn!(manifest_url = %manifest_url, error = %e, "Failed to load group");
                self.select_no_cache(key).await;
                return true;
            }
        };

        let mut master = document_url.clone();
        master.set_fragment(None);

        let mut outbox = Outbox::default();
        {
            let mut registry = self.inner.registry.lock();
            let Some(host) = registry.host_mut(&key) else {
                return false;
            };
            host.selected_group = Some(group_id);
            let newest = registry
                .group(group_id)
                .and_then(|group| group.newest_complete_cache());
            registry.associate_host(&key, newest, &mut outbox);
            let status = registry.host_status(&key).unwrap_or(Status::Uncached);
            if let Some(sink) = registry.sink(self.id) {
                outbox.cache_selected(sink, host_id, newest, status);
            }
        }
        self.inner
            .run_update(group_id, Some(key), Some(master), outbox)
            .await;
        true
    }

    async fn select_existing_cache(&self, key: HostKey, cache_id: CacheId) -> bool {
        let mut outbox = Outbox::default();
        let selected = {
            let mut registry = self.inner.registry.lock();
            let owning_group = registry
                .cache(cache_id)
                .filter(|cache| cache.is_complete())
                .map(Cache::owning_group);
            if owning_group.is_some() {
                registry.associate_host(&key, Some(cache_id), &mut outbox);
                let status = registry.host_status(&key).unwrap_or(Status::Idle);
                if let Some(sink) = registry.sink(self.id) {
                    outbox.cache_selected(sink, key.host, Some(cache_id), status);
                }
            }
            owning_group
        };

        match selected {
            None => {
                warn!(host = %key, cache_id = %cache_id, "Prior cache is gone");
                self.select_no_cache(key).await;
            }
            Some(Some(group_id)) => {
                self.inner.run_update(group_id, None, None, outbox).await;
            }
            Some(None) => outbox.flush(self.inner.storage.as_ref()).await,
        }
        true
    }

    async fn select_no_cache(&self, key: HostKey) {
        let mut outbox = Outbox::default();
        if let Some(sink) = self.inner.registry.lock().sink(self.id) {
            outbox.cache_selected(sink, key.host, None, Status::Uncached);
        }
        outbox.flush(self.inner.storage.as_ref()).await;
    }

    /// The document was served from `prior_cache` but does not belong to
    /// it. The entry is flagged FOREIGN and the host selects afresh without
    /// a cache.
    pub async fn mark_as_foreign_entry(
        &self,
        host_id: HostId,
        document_url: &Url,
        prior_cache: CacheId,
    ) -> bool {
        let key = self.key(host_id);
        let marked = {
            let mut registry = self.inner.registry.lock();
            if registry.host(&key).is_none() {
                return false;
            }
            registry
                .cache_mut(prior_cache)
                .is_some_and(|cache| cache.mark_foreign(document_url))
        };
        if marked {
            if let Err(e) = self
                .inner
                .storage
                .mark_entry_foreign(prior_cache, document_url)
                .await
            {
                warn!(cache_id = %prior_cache, url = %document_url, error = %e, "Failed to persist foreign flag");
            }
        }
        self.select_cache(host_id, document_url, None, None).await
    }

    pub fn get_status(&self, host_id: HostId) -> Option<Status> {
        self.inner.registry.lock().host_status(&self.key(host_id))
    }

    /// Check the host's group for an update. Returns `false` if the host has
    /// no cache or its group is obsolete.
    pub async fn start_update(&self, host_id: HostId) -> bool {
        let key = self.key(host_id);
        let group_id = {
            let registry = self.inner.registry.lock();
            registry
                .host(&key)
                .and_then(|host| host.associated_cache)
                .and_then(|id| registry.cache(id))
                .and_then(Cache::owning_group)
                .filter(|id| registry.group(*id).is_some_and(|g| !g.is_obsolete()))
        };
        let Some(group_id) = group_id else {
            return false;
        };
        self.inner
            .run_update(group_id, None, None, Outbox::default())
            .await
    }

    /// Move the host to its group's newest cache. Returns `false` if there
    /// is nothing to swap to.
    pub async fn swap_cache(&self, host_id: HostId) -> bool {
        let mut outbox = Outbox::default();
        let swapped = self
            .inner
            .registry
            .lock()
            .swap_cache(&self.key(host_id), &mut outbox);
        outbox.flush(self.inner.storage.as_ref()).await;
        swapped
    }

    /// How a request made by the host for `url` is served. A host without a
    /// complete cache goes to the network.
    pub fn find_response(&self, host_id: HostId, url: &Url) -> Option<ResponseLookup> {
        let registry = self.inner.registry.lock();
        let host = registry.host(&self.key(host_id))?;
        let lookup = host
            .associated_cache
            .and_then(|id| registry.cache(id))
            .filter(|cache| cache.is_complete())
            .map_or(ResponseLookup::Network, |cache| cache.find_response(url));
        Some(lookup)
    }

    /// Unregister the backend and every host it owns.
    pub async fn close(self) {
        let mut outbox = Outbox::default();
        self.inner
            .registry
            .lock()
            .remove_backend(self.id, &mut outbox);
        outbox.flush(self.inner.storage.as_ref()).await;
        debug!(backend = self.id.0, "Closed backend");
    }
}
