use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use cache_manifest::Manifest;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{JobStage, StartOutcome, UpdateType, WorkList};
use crate::config::MANIFEST_MIME_TYPE;
use crate::error::{TransportError, UpdateFailure};
use crate::model::{CacheId, Entry, EntryFlags, GroupId, HostKey, UpdateStatus};
use crate::notifier::{AppCacheEvent, ErrorDetails, ErrorReason, HostNotifier, Outbox};
use crate::service::ServiceInner;
use crate::storage::{StorageKey, StoredBody};
use crate::transport::{FetchRequest, FetchResponse, Validators};

/// How a job ended.
#[derive(Debug)]
enum JobOutcome {
    Completed,
    NoUpdate,
    Obsolete,
    Failed(UpdateFailure),
    Cancelled,
}

/// Where the cancellable part of a job stopped.
enum Prepared {
    Finished(JobOutcome),
    /// Every resource is stored and the manifest re-validated.
    ReadyToPublish(FetchResponse),
}

/// The task driving one update of one group.
pub(crate) struct UpdateJob {
    inner: Arc<ServiceInner>,
    group_id: GroupId,
    manifest_url: Url,
    update_type: UpdateType,
    /// Newest complete cache when the job started.
    newest_cache: Option<CacheId>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    status_tx: Arc<watch::Sender<UpdateStatus>>,
    /// Skip change detection so queued master entries get fetched.
    force_download: bool,
}

impl UpdateJob {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        inner: Arc<ServiceInner>,
        group_id: GroupId,
        manifest_url: Url,
        update_type: UpdateType,
        newest_cache: Option<CacheId>,
        cancel: CancellationToken,
        wake: Arc<Notify>,
        status_tx: Arc<watch::Sender<UpdateStatus>>,
        force_download: bool,
    ) -> Self {
        Self {
            inner,
            group_id,
            manifest_url,
            update_type,
            newest_cache,
            cancel,
            wake,
            status_tx,
            force_download,
        }
    }

    /// Publish the CHECKING status and run the job on the runtime.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        self.status_tx.send_replace(UpdateStatus::Checking);
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(
            manifest_url = %self.manifest_url,
            update_type = ?self.update_type,
            "Starting update"
        );

        let prepared = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Prepared::Finished(JobOutcome::Cancelled),
            result = self.drive() => match result {
                Ok(prepared) => prepared,
                Err(failure) => Prepared::Finished(JobOutcome::Failed(failure)),
            },
        };

        // Once storage is asked to commit, publishing runs to completion.
        let outcome = match prepared {
            Prepared::Finished(outcome) => outcome,
            Prepared::ReadyToPublish(manifest_response) => {
                match self.publish(manifest_response).await {
                    Ok(true) => JobOutcome::Completed,
                    Ok(false) => JobOutcome::Cancelled,
                    Err(failure) => JobOutcome::Failed(failure),
                }
            }
        };

        self.finish(outcome).await;
    }

    async fn drive(&self) -> Result<Prepared, UpdateFailure> {
        // FETCH_MANIFEST
        let stored_manifest = if self.force_download {
            None
        } else {
            self.load_stored_manifest().await
        };
        let validators = stored_manifest
            .as_ref()
            .and_then(|(_, metadata)| Validators::from_metadata(metadata));
        let request = FetchRequest::new(self.manifest_url.clone()).with_validators(validators);
        let manifest_response = self
            .inner
            .transport
            .fetch(request)
            .await
            .map_err(UpdateFailure::ManifestFetch)?;

        match manifest_response.status {
            200 => {}
            304 if self.update_type == UpdateType::UpgradeAttempt => {
                return Ok(Prepared::Finished(JobOutcome::NoUpdate));
            }
            404 | 410 => return Ok(Prepared::Finished(JobOutcome::Obsolete)),
            // A 304 presupposes a cached copy, which a cache attempt lacks.
            status => return Err(UpdateFailure::ManifestStatus { status }),
        }

        if self.inner.config.update.require_manifest_mime_type
            && manifest_response.metadata.mime_type().as_deref() != Some(MANIFEST_MIME_TYPE)
        {
            return Err(UpdateFailure::ManifestMimeType(
                manifest_response.metadata.content_type.clone(),
            ));
        }

        let unchanged = stored_manifest
            .as_ref()
            .is_some_and(|(stored_body, _)| *stored_body == manifest_response.body);
        if unchanged {
            debug!(manifest_url = %self.manifest_url, "Manifest unchanged");
            return Ok(Prepared::Finished(JobOutcome::NoUpdate));
        }

        let manifest = cache_manifest::parse(&self.manifest_url, &manifest_response.body)?;

        // DOWNLOADING, then REFETCH_MANIFEST. Masters that join during the
        // refetch send the job back to downloading.
        self.begin_download(&manifest).await;
        loop {
            self.download().await?;
            self.set_stage(JobStage::RefetchManifest);
            self.refetch_manifest(&manifest_response).await?;
            if self.finish_refetch() {
                break;
            }
        }

        Ok(Prepared::ReadyToPublish(manifest_response))
    }

    /// Manifest body of the newest cache, used for change detection.
    async fn load_stored_manifest(&self) -> Option<StoredBody> {
        let cache_id = match self.update_type {
            UpdateType::UpgradeAttempt => self.newest_cache?,
            UpdateType::CacheAttempt => return None,
        };
        match self.inner.storage.read_manifest_body(cache_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(cache_id = %cache_id, error = %e, "Failed to load stored manifest");
                None
            }
        }
    }

    fn set_stage(&self, stage: JobStage) {
        if let Some(job) = self.inner.registry.lock().job_mut(self.group_id) {
            job.stage = stage;
        }
    }

    /// Leave the refetch stage. Returns `false` if masters were queued while
    /// it ran.
    fn finish_refetch(&self) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(job) = registry.job_mut(self.group_id) else {
            return true;
        };
        if job.fetch_queue.is_empty() {
            job.stage = JobStage::Publishing;
            true
        } else {
            job.stage = JobStage::Downloading;
            false
        }
    }

    async fn begin_download(&self, manifest: &Manifest) {
        let mut outbox = Outbox::default();
        {
            let mut registry = self.inner.registry.lock();
            let newest = self.newest_cache.and_then(|id| registry.cache(id));
            let pending: Vec<Url> = registry
                .job(self.group_id)
                .map(|job| job.pending_master_entries.keys().cloned().collect())
                .unwrap_or_default();
            let work_list = WorkList::build(&self.manifest_url, manifest, newest, &pending);

            let cache_id = registry.new_cache(self.group_id);
            if let Some(cache) = registry.cache_mut(cache_id) {
                cache.initialize_with_manifest(manifest);
            }

            let mut waiting: Vec<HostKey> = Vec::new();
            if let Some(job) = registry.job_mut(self.group_id) {
                job.fetch_queue = work_list.urls().cloned().collect::<VecDeque<_>>();
                job.work_list = work_list;
                job.inprogress_cache = Some(cache_id);
                job.stage = JobStage::Downloading;
                waiting = job.pending_master_entries.values().flatten().copied().collect();
            }

            // Hosts waiting on a master entry that have no cache yet follow
            // the cache being built.
            for key in &waiting {
                let unassociated = registry
                    .host(key)
                    .is_some_and(|host| host.associated_cache.is_none());
                if unassociated {
                    registry.associate_host(key, Some(cache_id), &mut outbox);
                }
            }

            if let Some(group) = registry.group_mut(self.group_id) {
                group.set_update_status(UpdateStatus::Downloading);
            }
            registry
                .all_hosts(self.group_id)
                .send(&registry.sinks, &AppCacheEvent::Downloading, &mut outbox);

            info!(
                manifest_url = %self.manifest_url,
                cache_id = %cache_id,
                resources = registry.job(self.group_id).map_or(0, |job| job.total()),
                "Downloading resources"
            );
        }
        outbox.flush(self.inner.storage.as_ref()).await;
        self.status_tx.send_replace(UpdateStatus::Downloading);
    }

    fn next_url(&self) -> Option<Url> {
        self.inner
            .registry
            .lock()
            .job_mut(self.group_id)
            .and_then(|job| job.fetch_queue.pop_front())
    }

    /// Fetch every queued URL with at most `fetch_concurrency` requests in
    /// flight, until the queue is drained.
    async fn download(&self) -> Result<(), UpdateFailure> {
        let limit = self.inner.config.update.fetch_concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < limit {
                let Some(url) = self.next_url() else {
                    break;
                };
                let transport = self.inner.transport.clone();
                in_flight.push(async move {
                    let result = transport.fetch(FetchRequest::new(url.clone())).await;
                    (url, result)
                });
            }

            if in_flight.is_empty() {
                return Ok(());
            }

            tokio::select! {
                Some((url, result)) = in_flight.next() => {
                    self.on_resource_fetched(url, result).await?;
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn on_resource_fetched(
        &self,
        url: Url,
        result: Result<FetchResponse, TransportError>,
    ) -> Result<(), UpdateFailure> {
        let flags = self
            .inner
            .registry
            .lock()
            .job(self.group_id)
            .and_then(|job| job.work_list.flags(&url))
            .unwrap_or_default();

        match result {
            Ok(response) if response.is_ok() => {
                let size = response.body.len() as u64;
                let key = self
                    .inner
                    .storage
                    .write_entry_body(&url, response.body, response.metadata)
                    .await?;
                self.store_entry(&url, key, size);
                debug!(url = %url, size, "Stored resource");
            }
            Ok(response) if response.is_gone() => {
                warn!(url = %url, status = response.status, "Resource gone, skipping");
            }
            other => {
                let (status, detail) = match &other {
                    Ok(response) => (Some(response.status), format!("HTTP {}", response.status)),
                    Err(e) => (None, e.to_string()),
                };
                if flags.is_mandatory() {
                    return Err(UpdateFailure::ResourceFetch {
                        url,
                        status,
                        detail,
                    });
                }
                if !self.copy_from_newest(&url).await? {
                    self.fail_master_entry(&url, status, detail).await;
                }
            }
        }

        self.report_progress(url).await;
        Ok(())
    }

    /// Add a stored body to the cache being built, with every role its URL
    /// has picked up so far.
    fn store_entry(&self, url: &Url, key: StorageKey, size: u64) {
        let mut registry = self.inner.registry.lock();
        let Some(job) = registry.job(self.group_id) else {
            return;
        };
        let flags = job.work_list.flags(url).unwrap_or(EntryFlags::MASTER);
        let Some(cache) = job.inprogress_cache.and_then(|id| registry.cache_mut(id)) else {
            return;
        };
        cache.add_or_merge_entry(Entry::new(url.clone(), flags, key, size));
    }

    /// On upgrade, reuse a master entry's body from the newest cache.
    async fn copy_from_newest(&self, url: &Url) -> Result<bool, UpdateFailure> {
        if self.update_type != UpdateType::UpgradeAttempt {
            return Ok(false);
        }
        let source = {
            let registry = self.inner.registry.lock();
            self.newest_cache
                .and_then(|id| registry.cache(id))
                .and_then(|cache| cache.get_entry(url))
                .map(|entry| entry.storage_key.clone())
        };
        let Some(source) = source else {
            return Ok(false);
        };
        let Some((body, metadata)) = self.inner.storage.read_entry_body(&source).await? else {
            return Ok(false);
        };

        let size = body.len() as u64;
        let key = self
            .inner
            .storage
            .write_entry_body(url, body, metadata)
            .await?;
        self.store_entry(url, key, size);
        info!(url = %url, "Copied master entry from newest cache");
        Ok(true)
    }

    async fn fail_master_entry(&self, url: &Url, status: Option<u16>, detail: String) {
        warn!(url = %url, detail = %detail, "Master entry failed to download");
        let mut outbox = Outbox::default();
        {
            let mut registry = self.inner.registry.lock();
            let Some(job) = registry.job_mut(self.group_id) else {
                return;
            };
            job.failed_masters += 1;
            let hosts = job.pending_master_entries.remove(url).unwrap_or_default();
            let inprogress = job.inprogress_cache;

            let mut notifier = HostNotifier::new();
            notifier.add_many(&hosts);
            let details = ErrorDetails {
                message: format!("Master entry fetch failed: {detail}"),
                reason: ErrorReason::Resource,
                url: Some(url.clone()),
                status,
            };
            notifier.send(&registry.sinks, &AppCacheEvent::Error(details), &mut outbox);

            for key in &hosts {
                let on_inprogress = registry
                    .host(key)
                    .is_some_and(|host| host.associated_cache.is_some() && host.associated_cache == inprogress);
                if on_inprogress {
                    registry.associate_host(key, None, &mut outbox);
                }
            }
        }
        outbox.flush(self.inner.storage.as_ref()).await;
    }

    async fn report_progress(&self, url: Url) {
        let mut outbox = Outbox::default();
        {
            let mut registry = self.inner.registry.lock();
            let Some(job) = registry.job_mut(self.group_id) else {
                return;
            };
            job.completed += 1;
            let event = AppCacheEvent::Progress {
                url,
                total: job.total(),
                completed: job.completed,
            };
            registry
                .all_hosts(self.group_id)
                .send(&registry.sinks, &event, &mut outbox);
        }
        outbox.flush(self.inner.storage.as_ref()).await;
    }

    /// Conditional re-fetch guarding against a manifest that changed while
    /// resources were downloading.
    async fn refetch_manifest(&self, first: &FetchResponse) -> Result<(), UpdateFailure> {
        let request = FetchRequest::new(self.manifest_url.clone())
            .with_validators(Validators::from_metadata(&first.metadata));
        let response = self
            .inner
            .transport
            .fetch(request)
            .await
            .map_err(UpdateFailure::ManifestFetch)?;

        match response.status {
            304 => Ok(()),
            200 if response.body == first.body => Ok(()),
            200 => Err(UpdateFailure::ManifestChanged),
            status => Err(UpdateFailure::ManifestStatus { status }),
        }
    }

    /// Store the manifest entry, publish the cache durably, then make it
    /// the group's newest. Returns `false` if the job was cancelled before
    /// the record was committed.
    async fn publish(&self, manifest_response: FetchResponse) -> Result<bool, UpdateFailure> {
        let (cache_id, manifest_flags) = {
            let registry = self.inner.registry.lock();
            let job = registry.job(self.group_id);
            let cache_id = job.and_then(|job| job.inprogress_cache);
            let masters_failed = job.is_some_and(|job| job.failed_masters > 0);
            let Some(cache) = cache_id.and_then(|id| registry.cache(id)) else {
                return Err(UpdateFailure::MasterEntriesFailed);
            };
            if self.update_type == UpdateType::CacheAttempt && masters_failed && !cache.has_hosts()
            {
                return Err(UpdateFailure::MasterEntriesFailed);
            }
            let manifest_flags = job.map_or(EntryFlags::empty(), |job| {
                job.work_list.manifest_flags()
            });
            (cache.id(), manifest_flags | EntryFlags::MANIFEST)
        };

        let size = manifest_response.body.len() as u64;
        let body: Bytes = manifest_response.body;
        let key = self
            .inner
            .storage
            .write_entry_body(&self.manifest_url, body, manifest_response.metadata)
            .await?;

        let update_time = Utc::now();
        let record = {
            let mut registry = self.inner.registry.lock();
            let Some(cache) = registry.cache_mut(cache_id) else {
                return Err(UpdateFailure::MasterEntriesFailed);
            };
            cache.add_or_merge_entry(Entry::new(
                self.manifest_url.clone(),
                manifest_flags,
                key,
                size,
            ));
            let mut record = cache.to_record(&self.manifest_url);
            record.update_time = update_time;
            record
        };

        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        self.inner
            .storage
            .atomic_publish(&self.manifest_url, &record)
            .await?;

        let mut outbox = Outbox::default();
        {
            let mut registry = self.inner.registry.lock();
            if let Some(cache) = registry.cache_mut(cache_id) {
                cache.mark_complete(update_time);
            }
            if let Some(job) = registry.job_mut(self.group_id) {
                job.inprogress_cache = None;
            }
            registry.add_cache_to_group(self.group_id, cache_id, &mut outbox);
        }
        outbox.flush(self.inner.storage.as_ref()).await;

        info!(
            manifest_url = %self.manifest_url,
            cache_id = %cache_id,
            entries = record.entries.len(),
            size = record.total_size(),
            "Published cache"
        );
        Ok(true)
    }

    /// Turn the outcome into one terminal notification, detach the job from
    /// its group and schedule a retry for transient failures.
    async fn finish(self, outcome: JobOutcome) {
        let mut outbox = Outbox::default();
        let mut retry_delay = None;
        let mut follow_up = None;
        let obsolete = matches!(outcome, JobOutcome::Obsolete);
        {
            let mut registry = self.inner.registry.lock();
            let registry = &mut *registry;
            let inprogress = registry
                .job(self.group_id)
                .and_then(|job| job.inprogress_cache);
            let newest = registry
                .group(self.group_id)
                .and_then(|group| group.newest_complete_cache());

            match &outcome {
                JobOutcome::Completed => {
                    let event = match self.update_type {
                        UpdateType::CacheAttempt => AppCacheEvent::Cached,
                        UpdateType::UpgradeAttempt => AppCacheEvent::UpdateReady,
                    };
                    registry
                        .all_hosts(self.group_id)
                        .send(&registry.sinks, &event, &mut outbox);
                }
                JobOutcome::NoUpdate => {
                    info!(manifest_url = %self.manifest_url, "No update needed");
                    registry.all_hosts(self.group_id).send(
                        &registry.sinks,
                        &AppCacheEvent::NoUpdate,
                        &mut outbox,
                    );
                }
                JobOutcome::Obsolete => {
                    info!(manifest_url = %self.manifest_url, "Manifest gone, group is obsolete");
                    registry.make_group_obsolete(self.group_id);
                    registry.associated_hosts(self.group_id).send(
                        &registry.sinks,
                        &AppCacheEvent::Obsolete,
                        &mut outbox,
                    );
                    let details = ErrorDetails::new("Manifest is gone", ErrorReason::Manifest)
                        .with_url(self.manifest_url.clone());
                    registry.pending_master_hosts(self.group_id).send(
                        &registry.sinks,
                        &AppCacheEvent::Error(details),
                        &mut outbox,
                    );
                }
                JobOutcome::Failed(failure) => {
                    error!(
                        manifest_url = %self.manifest_url,
                        error = %failure,
                        "Update failed"
                    );
                    let event = AppCacheEvent::Error(failure.details(&self.manifest_url));
                    registry
                        .all_hosts(self.group_id)
                        .send(&registry.sinks, &event, &mut outbox);
                }
                JobOutcome::Cancelled => {
                    info!(manifest_url = %self.manifest_url, "Update cancelled");
                }
            }

            if let Some(cache_id) = inprogress {
                registry.discard_cache(cache_id, newest, &mut outbox);
            }

            let mut queued = Vec::new();
            if let Some(group) = registry.group_mut(self.group_id) {
                // Drops the pending master bookkeeping with the job.
                group.set_update_status(UpdateStatus::Idle);
                queued = std::mem::take(&mut group.queued_masters);
            }
            if !matches!(outcome, JobOutcome::Cancelled) {
                registry.notify_status_changed(self.group_id, &mut outbox);
            }

            // Documents that arrived while this job was publishing.
            if !queued.is_empty() {
                match &outcome {
                    JobOutcome::Cancelled => {
                        debug!(queued = queued.len(), "Dropping queued master entries");
                    }
                    JobOutcome::Obsolete => {
                        let mut notifier = HostNotifier::new();
                        notifier.add_many(queued.iter().map(|(host, _)| host));
                        let details = ErrorDetails::new("Manifest is gone", ErrorReason::Manifest)
                            .with_url(self.manifest_url.clone());
                        notifier.send(&registry.sinks, &AppCacheEvent::Error(details), &mut outbox);
                    }
                    _ => {
                        info!(
                            manifest_url = %self.manifest_url,
                            queued = queued.len(),
                            "Starting update for queued master entries"
                        );
                        follow_up = Some(super::start_queued_update(
                            &self.inner,
                            registry,
                            self.group_id,
                            queued,
                            &mut outbox,
                        ));
                    }
                }
            }

            match &outcome {
                JobOutcome::Failed(failure) if failure.is_transient() => {
                    let attempts = registry
                        .retry_attempts
                        .entry(self.manifest_url.clone())
                        .or_insert(0);
                    *attempts += 1;
                    if *attempts <= self.inner.config.update.max_update_retries {
                        retry_delay = Some(self.inner.config.update.retry_delay(*attempts));
                    } else {
                        warn!(manifest_url = %self.manifest_url, "Giving up after repeated failures");
                        registry.retry_attempts.remove(&self.manifest_url);
                    }
                }
                JobOutcome::Cancelled => {}
                _ => {
                    registry.retry_attempts.remove(&self.manifest_url);
                }
            }

            registry.collect_group(self.group_id);
        }

        outbox.flush(self.inner.storage.as_ref()).await;
        if obsolete {
            if let Err(e) = self.inner.storage.make_group_obsolete(&self.manifest_url).await {
                warn!(manifest_url = %self.manifest_url, error = %e, "Failed to drop obsolete group");
            }
        }
        {
            // A job started while the outbox was flushing owns the status now.
            let registry = self.inner.registry.lock();
            let superseded = registry
                .group(self.group_id)
                .is_some_and(|group| group.job.is_some());
            if !superseded {
                self.status_tx.send_replace(UpdateStatus::Idle);
            }
        }
        if let Some(StartOutcome::Started(job)) = follow_up {
            job.spawn();
        }

        if let Some(delay) = retry_delay {
            info!(manifest_url = %self.manifest_url, delay = ?delay, "Scheduling update retry");
            self.inner.schedule_retry(self.manifest_url.clone(), delay);
        }
    }
}
