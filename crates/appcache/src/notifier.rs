//! # Host Notification
//!
//! Event vocabulary delivered to frontends, and the [`HostNotifier`] that
//! fans a single event out to many hosts with one call per frontend.
//!
//! Notifications are collected into an [`Outbox`] while the service state is
//! locked and delivered once the lock is released, so a sink may call back
//! into the service.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::warn;
use url::Url;

use crate::model::{BackendId, CacheId, HostId, HostKey};
use crate::storage::{CacheStorage, StorageKey};

/// Status of a host as reported to its frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Uncached,
    Idle,
    Checking,
    Downloading,
    UpdateReady,
    Obsolete,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Uncached => "UNCACHED",
            Status::Idle => "IDLE",
            Status::Checking => "CHECKING",
            Status::Downloading => "DOWNLOADING",
            Status::UpdateReady => "UPDATE_READY",
            Status::Obsolete => "OBSOLETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    Checking,
    Downloading,
    Progress,
    UpdateReady,
    Cached,
    NoUpdate,
    Obsolete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// The manifest could not be fetched or had the wrong type.
    Manifest,
    /// The manifest was fetched but is not a cache manifest.
    Signature,
    /// The manifest changed while resources were downloading.
    Changed,
    /// A mandatory resource failed to download.
    Resource,
    Quota,
    Unknown,
}

/// Payload of an `ERROR` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetails {
    pub message: String,
    pub reason: ErrorReason,
    pub url: Option<Url>,
    pub status: Option<u16>,
}

impl ErrorDetails {
    pub fn new(message: impl Into<String>, reason: ErrorReason) -> Self {
        Self {
            message: message.into(),
            reason,
            url: None,
            status: None,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCacheEvent {
    Checking,
    Downloading,
    Progress {
        url: Url,
        total: usize,
        completed: usize,
    },
    UpdateReady,
    Cached,
    NoUpdate,
    Obsolete,
    Error(ErrorDetails),
}

impl AppCacheEvent {
    pub fn id(&self) -> EventId {
        match self {
            AppCacheEvent::Checking => EventId::Checking,
            AppCacheEvent::Downloading => EventId::Downloading,
            AppCacheEvent::Progress { .. } => EventId::Progress,
            AppCacheEvent::UpdateReady => EventId::UpdateReady,
            AppCacheEvent::Cached => EventId::Cached,
            AppCacheEvent::NoUpdate => EventId::NoUpdate,
            AppCacheEvent::Obsolete => EventId::Obsolete,
            AppCacheEvent::Error(_) => EventId::Error,
        }
    }

    /// Events that end an update.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppCacheEvent::UpdateReady
                | AppCacheEvent::Cached
                | AppCacheEvent::NoUpdate
                | AppCacheEvent::Obsolete
                | AppCacheEvent::Error(_)
        )
    }
}

/// Notification interface implemented by each frontend.
///
/// Calls are made without any engine lock held.
pub trait FrontendSink: Send + Sync {
    fn on_cache_selected(&self, host_id: HostId, cache_id: Option<CacheId>, status: Status);

    fn on_status_changed(&self, host_ids: &[HostId], status: Status);

    fn on_event_raised(&self, host_ids: &[HostId], event: &AppCacheEvent);
}

pub(crate) type SinkMap = HashMap<BackendId, Arc<dyn FrontendSink>>;

/// Collects hosts grouped by frontend so one `send` makes one call per
/// frontend. A host added more than once is delivered to once.
#[derive(Debug, Default, Clone)]
pub struct HostNotifier {
    hosts_by_backend: BTreeMap<BackendId, BTreeSet<HostId>>,
}

impl HostNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the host was already present.
    pub fn add(&mut self, key: HostKey) -> bool {
        self.hosts_by_backend
            .entry(key.backend)
            .or_default()
            .insert(key.host)
    }

    pub fn add_many<'a>(&mut self, keys: impl IntoIterator<Item = &'a HostKey>) {
        for key in keys {
            self.add(*key);
        }
    }

    pub fn contains(&self, key: &HostKey) -> bool {
        self.hosts_by_backend
            .get(&key.backend)
            .is_some_and(|hosts| hosts.contains(&key.host))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts_by_backend.values().all(BTreeSet::is_empty)
    }

    pub fn len(&self) -> usize {
        self.hosts_by_backend.values().map(BTreeSet::len).sum()
    }

    pub(crate) fn send(&self, sinks: &SinkMap, event: &AppCacheEvent, outbox: &mut Outbox) {
        self.dispatch(sinks, outbox, || Notification::Event(event.clone()));
    }

    pub(crate) fn send_status(&self, sinks: &SinkMap, status: Status, outbox: &mut Outbox) {
        self.dispatch(sinks, outbox, || Notification::StatusChanged(status));
    }

    fn dispatch(
        &self,
        sinks: &SinkMap,
        outbox: &mut Outbox,
        notification: impl Fn() -> Notification,
    ) {
        for (backend, hosts) in &self.hosts_by_backend {
            if hosts.is_empty() {
                continue;
            }
            let Some(sink) = sinks.get(backend) else {
                warn!(backend = backend.0, "No sink registered for backend");
                continue;
            };
            outbox.deliveries.push(Delivery {
                sink: sink.clone(),
                host_ids: hosts.iter().copied().collect(),
                notification: notification(),
            });
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Notification {
    CacheSelected {
        cache_id: Option<CacheId>,
        status: Status,
    },
    StatusChanged(Status),
    Event(AppCacheEvent),
}

pub(crate) struct Delivery {
    sink: Arc<dyn FrontendSink>,
    host_ids: Vec<HostId>,
    notification: Notification,
}

/// Deferred side effects of one state transition: notifications to deliver
/// and bodies no longer referenced by any cache.
#[derive(Default)]
pub(crate) struct Outbox {
    deliveries: Vec<Delivery>,
    garbage: Vec<StorageKey>,
}

impl Outbox {
    pub(crate) fn cache_selected(
        &mut self,
        sink: Arc<dyn FrontendSink>,
        host_id: HostId,
        cache_id: Option<CacheId>,
        status: Status,
    ) {
        self.deliveries.push(Delivery {
            sink,
            host_ids: vec![host_id],
            notification: Notification::CacheSelected { cache_id, status },
        });
    }

    pub(crate) fn discard(&mut self, keys: impl IntoIterator<Item = StorageKey>) {
        self.garbage.extend(keys);
    }

    #[cfg(test)]
    pub(crate) fn garbage_len(&self) -> usize {
        self.garbage.len()
    }

    pub(crate) fn append(&mut self, mut other: Outbox) {
        self.deliveries.append(&mut other.deliveries);
        self.garbage.append(&mut other.garbage);
    }

    /// Deliver notifications in the order they were queued.
    pub(crate) fn deliver(&mut self) {
        for delivery in self.deliveries.drain(..) {
            match &delivery.notification {
                Notification::CacheSelected { cache_id, status } => {
                    for host_id in &delivery.host_ids {
                        delivery.sink.on_cache_selected(*host_id, *cache_id, *status);
                    }
                }
                Notification::StatusChanged(status) => {
                    delivery.sink.on_status_changed(&delivery.host_ids, *status);
                }
                Notification::Event(event) => {
                    delivery.sink.on_event_raised(&delivery.host_ids, event);
                }
            }
        }
    }

    /// Deliver notifications, then delete discarded bodies.
    pub(crate) async fn flush(mut self, storage: &dyn CacheStorage) {
        self.deliver();
        for key in self.garbage.drain(..) {
            if let Err(e) = storage.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete discarded body");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    fn key(backend: u32, host: i32) -> HostKey {
        HostKey::new(BackendId(backend), HostId(host))
    }

    #[test]
    fn test_one_delivery_per_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let mut sinks: SinkMap = HashMap::new();
        sinks.insert(BackendId(1), first.clone());
        sinks.insert(BackendId(2), second.clone());

        let mut notifier = HostNotifier::new();
        notifier.add_many(&[key(1, 1), key(1, 2), key(1, 3), key(2, 1)]);
        // Reached through both associated and pending passes.
        assert!(!notifier.add(key(1, 2)));
        assert_eq!(notifier.len(), 4);

        let mut outbox = Outbox::default();
        notifier.send(&sinks, &AppCacheEvent::Checking, &mut outbox);
        outbox.deliver();

        let calls = first.event_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![HostId(1), HostId(2), HostId(3)]);
        assert_eq!(calls[0].1, AppCacheEvent::Checking);
        assert_eq!(second.event_calls().len(), 1);
    }

    #[test]
    fn test_empty_notifier_sends_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mut sinks: SinkMap = HashMap::new();
        sinks.insert(BackendId(1), sink.clone());

        let notifier = HostNotifier::new();
        assert!(notifier.is_empty());
        let mut outbox = Outbox::default();
        notifier.send_status(&sinks, Status::Idle, &mut outbox);
        outbox.deliver();
        assert!(sink.status_calls().is_empty());
    }

    #[test]
    fn test_terminal_events() {
        assert!(AppCacheEvent::Cached.is_terminal());
        assert!(!AppCacheEvent::Downloading.is_terminal());
        assert_eq!(
            AppCacheEvent::Error(ErrorDetails::new("boom", ErrorReason::Unknown)).id(),
            EventId::Error
        );
    }
}
