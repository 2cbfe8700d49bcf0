//! # Update
//!
//! The update job: manifest fetch, change detection, resource download,
//! manifest re-validation and atomic publish.
//!
//! At most one job runs per group. The job's shared bookkeeping
//! ([`JobState`]) lives inside the group so that a second start request can
//! join it under the registry lock; the job task itself only holds the lock
//! between suspension points.

mod job;
mod worklist;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub(crate) use job::UpdateJob;
pub(crate) use worklist::WorkList;

use crate::model::{CacheId, EntryFlags, GroupId, HostKey, Registry, UpdateStatus};
use crate::notifier::{AppCacheEvent, HostNotifier, Outbox};
use crate::service::ServiceInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// The group has no complete cache yet.
    CacheAttempt,
    /// The group already has a complete cache.
    UpgradeAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    FetchManifest,
    Downloading,
    RefetchManifest,
    Publishing,
}

/// Bookkeeping of a running update, shared between the job task and
/// callers joining it.
#[derive(Debug)]
pub(crate) struct JobState {
    pub(crate) manifest_url: Url,
    pub(crate) update_type: UpdateType,
    pub(crate) stage: JobStage,
    /// Hosts waiting for their document to be added, by document URL.
    pub(crate) pending_master_entries: BTreeMap<Url, Vec<HostKey>>,
    pub(crate) work_list: WorkList,
    /// URLs not yet dispatched.
    pub(crate) fetch_queue: VecDeque<Url>,
    pub(crate) inprogress_cache: Option<CacheId>,
    pub(crate) completed: usize,
    pub(crate) failed_masters: usize,
    pub(crate) cancel: CancellationToken,
    /// Signalled when a URL is queued during download.
    pub(crate) wake: Arc<Notify>,
}

impl JobState {
    fn new(manifest_url: Url, update_type: UpdateType, cancel: CancellationToken) -> Self {
        Self {
            manifest_url,
            update_type,
            stage: JobStage::FetchManifest,
            pending_master_entries: BTreeMap::new(),
            work_list: WorkList::default(),
            fetch_queue: VecDeque::new(),
            inprogress_cache: None,
            completed: 0,
            failed_masters: 0,
            cancel,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Record `host` as waiting for `url`. Returns `false` if it already was.
    pub(crate) fn add_pending_master(&mut self, url: Url, host: HostKey) -> bool {
        let hosts = self.pending_master_entries.entry(url).or_default();
        if hosts.contains(&host) {
            return false;
        }
        hosts.push(host);
        true
    }

    pub(crate) fn forget_host(&mut self, host: &HostKey) {
        for hosts in self.pending_master_entries.values_mut() {
            hosts.retain(|key| key != host);
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.work_list.len()
    }

    fn accepts_new_urls(&self) -> bool {
        matches!(
            self.stage,
            JobStage::Downloading | JobStage::RefetchManifest
        )
    }
}

pub(crate) enum StartOutcome {
    /// A new job was created; spawn it once the outbox is flushed.
    Started(UpdateJob),
    Joined,
    /// The group is obsolete or gone.
    Rejected,
}

/// Start an update of `group_id`, or join the one already running.
///
/// `host` and `new_master` name a document that should be added to the
/// cache as a master entry.
pub(crate) fn start_update(
    inner: &Arc<ServiceInner>,
    registry: &mut Registry,
    group_id: GroupId,
    host: Option<HostKey>,
    new_master: Option<Url>,
    outbox: &mut Outbox,
) -> StartOutcome {
    let Some(group) = registry.group(group_id) else {
        return StartOutcome::Rejected;
    };
    if group.is_obsolete() {
        return StartOutcome::Rejected;
    }
    if group.job.is_some() {
        join_update(registry, group_id, host, new_master, outbox);
        return StartOutcome::Joined;
    }
    let masters = host.zip(new_master).into_iter().collect();
    create_job(inner, registry, group_id, masters, false, outbox)
}

/// Start the update owed to documents that joined while the previous one
/// was publishing. Change detection is skipped so their master entries are
/// fetched even if the manifest is unchanged.
pub(crate) fn start_queued_update(
    inner: &Arc<ServiceInner>,
    registry: &mut Registry,
    group_id: GroupId,
    queued: Vec<(HostKey, Url)>,
    outbox: &mut Outbox,
) -> StartOutcome {
    create_job(inner, registry, group_id, queued, true, outbox)
}

fn create_job(
    inner: &Arc<ServiceInner>,
    registry: &mut Registry,
    group_id: GroupId,
    masters: Vec<(HostKey, Url)>,
    force_download: bool,
    outbox: &mut Outbox,
) -> StartOutcome {
    let Some(group) = registry.group(group_id) else {
        return StartOutcome::Rejected;
    };
    if group.is_obsolete() || group.job.is_some() {
        return StartOutcome::Rejected;
    }
    let manifest_url = group.manifest_url().clone();
    let newest = group.newest_complete_cache();
    let status_tx = group.status_sender();

    let update_type = match newest {
        Some(_) => UpdateType::UpgradeAttempt,
        None => UpdateType::CacheAttempt,
    };
    let cancel = inner.shutdown.child_token();
    let mut state = JobState::new(manifest_url.clone(), update_type, cancel.clone());
    for (host, url) in masters {
        state.add_pending_master(url, host);
    }
    let wake = state.wake.clone();

    let Some(group) = registry.group_mut(group_id) else {
        return StartOutcome::Rejected;
    };
    group.job = Some(state);
    group.set_update_status(UpdateStatus::Checking);

    registry
        .all_hosts(group_id)
        .send(&registry.sinks, &AppCacheEvent::Checking, outbox);

    StartOutcome::Started(UpdateJob::new(
        inner.clone(),
        group_id,
        manifest_url,
        update_type,
        newest,
        cancel,
        wake,
        status_tx,
        force_download,
    ))
}

fn join_update(
    registry: &mut Registry,
    group_id: GroupId,
    host: Option<HostKey>,
    new_master: Option<Url>,
    outbox: &mut Outbox,
) {
    let (Some(host), Some(url)) = (host, new_master) else {
        return;
    };
    let Some(group) = registry.group_mut(group_id) else {
        return;
    };
    let update_status = group.update_status();
    let publishing = group
        .job
        .as_ref()
        .is_some_and(|job| job.stage == JobStage::Publishing);
    if publishing {
        // Too late for the cache being published; the document waits for a
        // follow-up update.
        let queued = (host, url);
        if !group.queued_masters.contains(&queued) {
            debug!(
                host = %queued.0,
                url = %queued.1,
                "Queued master entry behind publishing update"
            );
            group.queued_masters.push(queued);
        }
        return;
    }
    let Some(job) = registry.job_mut(group_id) else {
        return;
    };
    if !job.add_pending_master(url.clone(), host) {
        return;
    }
    debug!(host = %host, url = %url, "Joined running update");

    let mut merge_into = None;
    if job.accepts_new_urls() {
        let manifest_url = job.manifest_url.clone();
        if job
            .work_list
            .add(&manifest_url, url.clone(), EntryFlags::MASTER)
        {
            job.fetch_queue.push_back(url.clone());
            job.wake.notify_one();
        } else {
            // Already fetched or in flight; the stored entry picks up the role.
            merge_into = job.inprogress_cache;
        }
    }
    let inprogress = job.inprogress_cache;

    if let Some(cache) = merge_into.and_then(|id| registry.cache_mut(id)) {
        cache.merge_entry_flags(&url, EntryFlags::MASTER);
    }
    let unassociated = registry
        .host(&host)
        .is_some_and(|h| h.associated_cache.is_none());
    if unassociated && inprogress.is_some() {
        registry.associate_host(&host, inprogress, outbox);
    }

    // Replay what the rest of the group has already seen.
    let mut notifier = HostNotifier::new();
    notifier.add(host);
    notifier.send(&registry.sinks, &AppCacheEvent::Checking, outbox);
    if update_status == UpdateStatus::Downloading {
        notifier.send(&registry.sinks, &AppCacheEvent::Downloading, outbox);
    }
}
