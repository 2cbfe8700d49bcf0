use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use super::{CacheId, HostKey};
use crate::update::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStatus {
    #[default]
    Idle,
    Checking,
    Downloading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheSlot {
    id: CacheId,
    update_time: DateTime<Utc>,
}

/// Versioned container for every cache built from one manifest URL.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    manifest_url: Url,
    newest: Option<CacheSlot>,
    old_caches: Vec<CacheSlot>,
    update_status: UpdateStatus,
    is_obsolete: bool,
    pub(crate) job: Option<JobState>,
    /// Documents that joined while the job was publishing.
    pub(crate) queued_masters: Vec<(HostKey, Url)>,
    status_tx: Arc<watch::Sender<UpdateStatus>>,
}

impl Group {
    pub fn new(id: GroupId, manifest_url: Url) -> Self {
        let (status_tx, _) = watch::channel(UpdateStatus::Idle);
        Self {
            id,
            manifest_url,
            newest: None,
            old_caches: Vec::new(),
            update_status: UpdateStatus::Idle,
            is_obsolete: false,
            job: None,
            queued_masters: Vec::new(),
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    pub fn newest_complete_cache(&self) -> Option<CacheId> {
        self.newest.map(|slot| slot.id)
    }

    pub fn old_caches(&self) -> impl Iterator<Item = CacheId> + '_ {
        self.old_caches.iter().map(|slot| slot.id)
    }

    pub fn has_caches(&self) -> bool {
        self.newest.is_some() || !self.old_caches.is_empty()
    }

    pub fn update_status(&self) -> UpdateStatus {
        self.update_status
    }

    pub fn is_obsolete(&self) -> bool {
        self.is_obsolete
    }

    pub fn set_obsolete(&mut self) {
        self.is_obsolete = true;
    }

    /// Channel used to observe status changes. The engine publishes on it
    /// only after the notifications for the change have been delivered.
    pub(crate) fn status_sender(&self) -> Arc<watch::Sender<UpdateStatus>> {
        self.status_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status_tx.subscribe()
    }

    /// Adopt a complete cache. The later `update_time` becomes newest and
    /// the other is demoted to the old caches; the demoted id is returned.
    pub fn add_cache(&mut self, id: CacheId, update_time: DateTime<Utc>) -> Option<CacheId> {
        let incoming = CacheSlot { id, update_time };
        match self.newest {
            None => {
                self.newest = Some(incoming);
                None
            }
            Some(current) if incoming.update_time >= current.update_time => {
                self.old_caches.push(current);
                self.newest = Some(incoming);
                Some(current.id)
            }
            Some(_) => {
                self.old_caches.push(incoming);
                Some(incoming.id)
            }
        }
    }

    /// Drop a cache from the group. Removing the newest cache is rejected
    /// while older caches remain.
    pub fn remove_cache(&mut self, id: CacheId) -> bool {
        if self.newest.map(|slot| slot.id) == Some(id) {
            if !self.old_caches.is_empty() {
                return false;
            }
            self.newest = None;
            return true;
        }
        match self.old_caches.iter().position(|slot| slot.id == id) {
            Some(index) => {
                self.old_caches.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains_cache(&self, id: CacheId) -> bool {
        self.newest.map(|slot| slot.id) == Some(id) || self.old_caches.iter().any(|s| s.id == id)
    }

    /// Change the update status. Returning to IDLE from any other status is
    /// the single point where an update completes: the job is detached and
    /// handed back to the caller.
    pub(crate) fn set_update_status(&mut self, status: UpdateStatus) -> Option<JobState> {
        let previous = std::mem::replace(&mut self.update_status, status);
        if status == UpdateStatus::Idle && previous != UpdateStatus::Idle {
            debug!(group = %self.id, manifest_url = %self.manifest_url, "Update complete");
            return self.job.take();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn group() -> Group {
        Group::new(GroupId(1), Url::parse("http://example.com/app.appcache").unwrap())
    }

    #[test]
    fn test_later_timestamp_wins() {
        let mut group = group();
        let now = Utc::now();

        assert_eq!(group.add_cache(CacheId(1), now), None);
        assert_eq!(group.add_cache(CacheId(2), now + Duration::seconds(5)), Some(CacheId(1)));
        assert_eq!(group.newest_complete_cache(), Some(CacheId(2)));

        // Completed out of order: older timestamp goes straight to old caches.
        assert_eq!(group.add_cache(CacheId(3), now + Duration::seconds(1)), Some(CacheId(3)));
        assert_eq!(group.newest_complete_cache(), Some(CacheId(2)));
        assert_eq!(group.old_caches().collect::<Vec<_>>(), vec![CacheId(1), CacheId(3)]);
    }

    #[test]
    fn test_remove_newest_rejected_while_old_caches_exist() {
        let mut group = group();
        let now = Utc::now();
        group.add_cache(CacheId(1), now);
        group.add_cache(CacheId(2), now + Duration::seconds(1));

        assert!(!group.remove_cache(CacheId(2)));
        assert_eq!(group.newest_complete_cache(), Some(CacheId(2)));

        assert!(group.remove_cache(CacheId(1)));
        assert!(group.remove_cache(CacheId(2)));
        assert!(!group.has_caches());
        assert!(!group.remove_cache(CacheId(9)));
    }

    #[test]
    fn test_idle_transition_detaches_once() {
        let mut group = group();
        assert!(group.set_update_status(UpdateStatus::Idle).is_none());
        assert!(group.set_update_status(UpdateStatus::Checking).is_none());
        assert!(group.set_update_status(UpdateStatus::Downloading).is_none());
        group.set_update_status(UpdateStatus::Idle);
        assert_eq!(group.update_status(), UpdateStatus::Idle);
        assert!(group.job.is_none());
    }
}
