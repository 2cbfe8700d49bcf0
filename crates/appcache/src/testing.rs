//! Shared helpers for the engine's tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::AppCacheConfig;
use crate::error::StorageResult;
use crate::model::{CacheId, HostId};
use crate::notifier::{AppCacheEvent, EventId, FrontendSink, Status};
use crate::service::{AppCacheBackend, AppCacheService};
use crate::storage::{
    CacheRecord, CacheStorage, MemoryStorage, ResponseMetadata, StorageKey, StoredBody,
};
use crate::transport::MockTransport;

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
macro_rules! init_test_tracing {
    () => {
        init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

pub(crate) use init_test_tracing;

/// Sink that records every call it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    selected: Mutex<Vec<(HostId, Option<CacheId>, Status)>>,
    statuses: Mutex<Vec<(Vec<HostId>, Status)>>,
    events: Mutex<Vec<(Vec<HostId>, AppCacheEvent)>>,
}

impl RecordingSink {
    pub(crate) fn selected_calls(&self) -> Vec<(HostId, Option<CacheId>, Status)> {
        self.selected.lock().clone()
    }

    pub(crate) fn status_calls(&self) -> Vec<(Vec<HostId>, Status)> {
        self.statuses.lock().clone()
    }

    pub(crate) fn event_calls(&self) -> Vec<(Vec<HostId>, AppCacheEvent)> {
        self.events.lock().clone()
    }

    /// Event ids delivered to `host`, in order.
    pub(crate) fn events_for(&self, host: HostId) -> Vec<EventId> {
        self.events
            .lock()
            .iter()
            .filter(|(hosts, _)| hosts.contains(&host))
            .map(|(_, event)| event.id())
            .collect()
    }

    /// Same as [`events_for`](Self::events_for) without progress events.
    pub(crate) fn milestones_for(&self, host: HostId) -> Vec<EventId> {
        self.events_for(host)
            .into_iter()
            .filter(|id| *id != EventId::Progress)
            .collect()
    }

    pub(crate) fn terminal_events(&self) -> Vec<AppCacheEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| event.is_terminal())
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl FrontendSink for RecordingSink {
    fn on_cache_selected(&self, host_id: HostId, cache_id: Option<CacheId>, status: Status) {
        self.selected.lock().push((host_id, cache_id, status));
    }

    fn on_status_changed(&self, host_ids: &[HostId], status: Status) {
        self.statuses.lock().push((host_ids.to_vec(), status));
    }

    fn on_event_raised(&self, host_ids: &[HostId], event: &AppCacheEvent) {
        self.events.lock().push((host_ids.to_vec(), event.clone()));
    }
}

/// [`MemoryStorage`] whose publishes and deletes can be held open.
///
/// A held publish commits first and then waits, the way a rename finished
/// on a blocking thread before its caller resumed.
pub(crate) struct GatedStorage {
    inner: Arc<MemoryStorage>,
    publish_gate: Mutex<Option<Arc<Semaphore>>>,
    delete_gate: Mutex<Option<Arc<Semaphore>>>,
    publishes: AtomicUsize,
    deletes: AtomicUsize,
}

impl GatedStorage {
    pub(crate) fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            publish_gate: Mutex::new(None),
            delete_gate: Mutex::new(None),
            publishes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn hold_publish(&self) {
        *self.publish_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_publish(&self) {
        if let Some(gate) = self.publish_gate.lock().take() {
            gate.close();
        }
    }

    pub(crate) fn hold_deletes(&self) {
        *self.delete_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_deletes(&self) {
        if let Some(gate) = self.delete_gate.lock().take() {
            gate.close();
        }
    }

    /// Publishes committed so far.
    pub(crate) fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Deletes started so far, held or not.
    pub(crate) fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().clone();
        if let Some(gate) = gate {
            // Closed on release.
            let _ = gate.acquire().await;
        }
    }
}

#[async_trait]
impl CacheStorage for GatedStorage {
    async fn read_entry_body(&self, key: &StorageKey) -> StorageResult<Option<StoredBody>> {
        self.inner.read_entry_body(key).await
    }

    async fn write_entry_body(
        &self,
        url: &Url,
        data: Bytes,
        metadata: ResponseMetadata,
    ) -> StorageResult<StorageKey> {
        self.inner.write_entry_body(url, data, metadata).await
    }

    async fn read_manifest_body(&self, cache_id: CacheId) -> StorageResult<Option<StoredBody>> {
        self.inner.read_manifest_body(cache_id).await
    }

    async fn atomic_publish(&self, manifest_url: &Url, cache: &CacheRecord) -> StorageResult<()> {
        self.inner.atomic_publish(manifest_url, cache).await?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.publish_gate).await;
        Ok(())
    }

    async fn load_group(&self, manifest_url: &Url) -> StorageResult<Option<CacheRecord>> {
        self.inner.load_group(manifest_url).await
    }

    async fn make_group_obsolete(&self, manifest_url: &Url) -> StorageResult<()> {
        self.inner.make_group_obsolete(manifest_url).await
    }

    async fn mark_entry_foreign(&self, cache_id: CacheId, url: &Url) -> StorageResult<()> {
        self.inner.mark_entry_foreign(cache_id, url).await
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.delete_gate).await;
        self.inner.delete(key).await
    }
}

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub(crate) fn manifest_url() -> Url {
    url("http://example.com/app.appcache")
}

pub(crate) fn doc_url() -> Url {
    url("http://example.com/index.html")
}

/// A service over a scripted transport and in-memory storage, with one
/// backend reporting to a [`RecordingSink`].
pub(crate) struct Harness {
    pub(crate) service: AppCacheService,
    pub(crate) backend: AppCacheBackend,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) sink: Arc<RecordingSink>,
}

impl Harness {
    /// Automatic retries are off unless a test configures them.
    pub(crate) fn config() -> AppCacheConfig {
        AppCacheConfig::builder()
            .with_retries(0, Duration::from_millis(10))
            .build()
    }

    pub(crate) fn new() -> Self {
        Self::build(Self::config(), MockTransport::new(), Arc::new(MemoryStorage::new()))
    }

    pub(crate) fn with_config(config: AppCacheConfig) -> Self {
        let storage = Arc::new(MemoryStorage::with_quota(config.storage.group_quota));
        Self::build(config, MockTransport::new(), storage)
    }

    pub(crate) fn with_transport(config: AppCacheConfig, transport: MockTransport) -> Self {
        Self::build(config, transport, Arc::new(MemoryStorage::new()))
    }

    pub(crate) fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        Self::build(Self::config(), MockTransport::new(), storage)
    }

    /// A harness whose service stores through a [`GatedStorage`]; the
    /// `storage` field is the memory storage behind it.
    pub(crate) fn with_gated_storage(config: AppCacheConfig) -> (Self, Arc<GatedStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let gated = Arc::new(GatedStorage::new(storage.clone()));
        let harness = Self::assemble(config, MockTransport::new(), storage, gated.clone());
        (harness, gated)
    }

    fn build(config: AppCacheConfig, transport: MockTransport, storage: Arc<MemoryStorage>) -> Self {
        Self::assemble(config, transport, storage.clone(), storage)
    }

    fn assemble(
        config: AppCacheConfig,
        transport: MockTransport,
        storage: Arc<MemoryStorage>,
        backing: Arc<dyn CacheStorage>,
    ) -> Self {
        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        let service = AppCacheService::new(config, backing, transport.clone());
        let backend = service.register_backend(sink.clone());
        Self {
            service,
            backend,
            transport,
            storage,
            sink,
        }
    }
}
