// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the single authority over download state.
//!
//! Every start or resume spawns one tokio task that waits on a counting
//! semaphore before calling into the source. The registry maps model ids to
//! their record, the live task's cancel handle and a watch channel that
//! completion waiters subscribe to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelHandle;
use super::source::{ProgressSink, SourceDownloader};
use super::state::StateStore;
use super::types::{CancelReason, DownloadRecord, DownloadStatus, ModelKind, ProgressReport};
use crate::error::DownloadError;
use crate::locks::{lock_or_recover, read_or_recover, write_or_recover};

/// Minimum spacing between state file writes from the progress path.
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a tracked download.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    /// Model being downloaded
    pub model_id: String,
    completion: watch::Receiver<DownloadRecord>,
}

impl DownloadHandle {
    /// Latest record snapshot.
    pub fn record(&self) -> DownloadRecord {
        self.completion.borrow().clone()
    }

    pub fn status(&self) -> DownloadStatus {
        self.completion.borrow().status
    }

    /// Wait until the download completes, fails or is cancelled.
    ///
    /// Also returns if the manager stops tracking the download without
    /// settling it (shutdown), in which case the record is `Paused`.
    pub async fn wait(&mut self) -> DownloadRecord {
        loop {
            if self.completion.borrow().status.is_settled() {
                return self.completion.borrow().clone();
            }
            if self.completion.changed().await.is_err() {
                // Channel closed
                return self.completion.borrow().clone();
            }
        }
    }
}

/// Registry slot for one model id.
struct Entry {
    record: DownloadRecord,
    /// Identifies the task currently allowed to mutate this record
    generation: u64,
    cancel: Option<CancelHandle>,
    task: Option<JoinHandle<()>>,
    notify: watch::Sender<DownloadRecord>,
    last_persisted: Instant,
}

impl Entry {
    fn new(record: DownloadRecord) -> Self {
        let (notify, _) = watch::channel(record.clone());
        Self {
            record,
            generation: 0,
            cancel: None,
            task: None,
            notify,
            last_persisted: Instant::now(),
        }
    }

    fn handle(&self) -> DownloadHandle {
        DownloadHandle {
            model_id: self.record.model_id.clone(),
            completion: self.notify.subscribe(),
        }
    }

    fn publish(&self) {
        self.notify.send_replace(self.record.clone());
    }
}

/// Everything a scheduled task needs.
struct Job {
    model_id: String,
    target_dir: PathBuf,
    generation: u64,
    cancel: CancelHandle,
    resume: bool,
    sink: Option<ProgressSink>,
    /// Previous task for the same id; awaited before touching the source
    previous: Option<JoinHandle<()>>,
}

struct Inner {
    source: Arc<dyn SourceDownloader>,
    store: StateStore,
    registry: RwLock<HashMap<String, Entry>>,
    /// Tasks of evicted entries, awaited by the next task for the same id
    retired: Mutex<HashMap<String, JoinHandle<()>>>,
    gate: Arc<Semaphore>,
    max_concurrent: usize,
    /// Serializes state file writes and deletes
    persist_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    generations: AtomicU64,
}

/// Manager for concurrency-bounded, resumable downloads.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager and recover every persisted download as `Paused`.
    pub fn new(
        source: Arc<dyn SourceDownloader>,
        store: StateStore,
        max_concurrent: usize,
    ) -> Result<Self, DownloadError> {
        let max_concurrent = max_concurrent.max(1);
        let recovered = store.load_all().map_err(DownloadError::persistence)?;

        if !recovered.is_empty() {
            tracing::info!("DOWNLOADS_RECOVERED | count={}", recovered.len());
        }
        let registry = recovered
            .into_iter()
            .map(|(id, record)| (id, Entry::new(record)))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                store,
                registry: RwLock::new(registry),
                retired: Mutex::new(HashMap::new()),
                gate: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                persist_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                generations: AtomicU64::new(0),
            }),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Start downloading `model_id` into `target_dir`.
    ///
    /// Returns immediately; the transfer runs in the background once a
    /// concurrency slot is free. An id that is already scheduled,
    /// downloading or completed gets its existing handle back; a paused id
    /// is resumed; a failed or cancelled id starts over.
    pub async fn start_download(
        &self,
        model_id: &str,
        kind: ModelKind,
        target_dir: impl Into<PathBuf>,
        progress: Option<ProgressSink>,
    ) -> Result<DownloadHandle, DownloadError> {
        let target_dir = target_dir.into();
        let scheduled = {
            let mut registry = write_or_recover(&self.inner.registry);
            // Shutdown cancels under this lock, so no task can slip past it
            self.inner.check_running(model_id)?;

            if let Some(entry) = registry.get_mut(model_id) {
                match entry.record.status {
                    DownloadStatus::Initializing
                    | DownloadStatus::Downloading
                    | DownloadStatus::Completed => return Ok(entry.handle()),
                    DownloadStatus::Paused => None,
                    DownloadStatus::Failed | DownloadStatus::Cancelled => {
                        entry.record = DownloadRecord::new(model_id, kind, target_dir);
                        self.inner.schedule(entry, false, progress.clone());
                        entry.publish();
                        Some(entry.handle())
                    }
                }
            } else {
                let mut entry = Entry::new(DownloadRecord::new(model_id, kind, target_dir));
                entry.task = lock_or_recover(&self.inner.retired).remove(model_id);
                self.inner.schedule(&mut entry, false, progress.clone());
                let handle = entry.handle();
                registry.insert(model_id.to_string(), entry);
                Some(handle)
            }
        };

        let Some(handle) = scheduled else {
            return self.resume_download(model_id, progress).await;
        };

        tracing::info!("DOWNLOAD_STARTED | model_id={} kind={}", model_id, kind);
        self.inner.persist_logged(model_id).await;
        Ok(handle)
    }

    /// Pause a download that is currently `Downloading`.
    pub async fn pause_download(&self, model_id: &str) -> Result<DownloadRecord, DownloadError> {
        self.inner.check_status(model_id, "pause", |s| s == DownloadStatus::Downloading)?;

        if !self.inner.source.pause(model_id).await {
            tracing::warn!("PAUSE_REFUSED | model_id={}", model_id);
            return Err(DownloadError::SourceRefused {
                model_id: model_id.to_string(),
                action: "pause",
            });
        }

        let record = {
            let mut registry = write_or_recover(&self.inner.registry);
            let entry = tracked(&mut registry, model_id)?;
            // Re-check: a racing pause/cancel may have won while we awaited the source
            if entry.record.status != DownloadStatus::Downloading {
                return Err(invalid(model_id, entry.record.status, "pause"));
            }
            if let Some(cancel) = entry.cancel.take() {
                cancel.trigger(CancelReason::UserPause);
            }
            entry.record.transition(DownloadStatus::Paused);
            entry.publish();
            entry.record.clone()
        };

        tracing::info!(
            "DOWNLOAD_PAUSED | model_id={} bytes={}",
            model_id,
            record.bytes_downloaded
        );
        self.inner.persist_logged(model_id).await;
        Ok(record)
    }

    /// Resume a `Paused` download through the source's resume entry point.
    pub async fn resume_download(
        &self,
        model_id: &str,
        progress: Option<ProgressSink>,
    ) -> Result<DownloadHandle, DownloadError> {
        let handle = {
            let mut registry = write_or_recover(&self.inner.registry);
            self.inner.check_running(model_id)?;
            let entry = tracked(&mut registry, model_id)?;
            if entry.record.status != DownloadStatus::Paused {
                return Err(invalid(model_id, entry.record.status, "resume"));
            }
            entry.record.transition(DownloadStatus::Downloading);
            entry.record.message = None;
            self.inner.schedule(entry, true, progress);
            entry.publish();
            entry.handle()
        };

        tracing::info!("DOWNLOAD_RESUMED | model_id={}", model_id);
        self.inner.persist_logged(model_id).await;
        Ok(handle)
    }

    /// Cancel a scheduled, downloading or paused download.
    ///
    /// The state file is deleted and the id stops being tracked.
    pub async fn cancel_download(&self, model_id: &str) -> Result<DownloadRecord, DownloadError> {
        let cancellable = |s: DownloadStatus| {
            matches!(
                s,
                DownloadStatus::Initializing | DownloadStatus::Downloading | DownloadStatus::Paused
            )
        };
        self.inner.check_status(model_id, "cancel", cancellable)?;

        if !self.inner.source.cancel(model_id).await {
            tracing::warn!("CANCEL_NOT_ACKNOWLEDGED | model_id={}", model_id);
        }

        let (record, notify) = {
            let mut registry = write_or_recover(&self.inner.registry);
            let entry = tracked(&mut registry, model_id)?;
            if !cancellable(entry.record.status) {
                return Err(invalid(model_id, entry.record.status, "cancel"));
            }
            if let Some(cancel) = entry.cancel.take() {
                cancel.trigger(CancelReason::UserCancel);
            }
            entry.record.transition(DownloadStatus::Cancelled);

            let entry = self.inner.evict(&mut registry, model_id);
            match entry {
                Some(entry) => (entry.record, entry.notify),
                None => return Err(not_tracked(model_id)),
            }
        };

        self.inner.forget(model_id).await;
        notify.send_replace(record.clone());
        tracing::info!("DOWNLOAD_CANCELLED | model_id={}", model_id);
        Ok(record)
    }

    pub fn get_record(&self, model_id: &str) -> Option<DownloadRecord> {
        read_or_recover(&self.inner.registry)
            .get(model_id)
            .map(|e| e.record.clone())
    }

    pub fn get_status(&self, model_id: &str) -> Option<DownloadStatus> {
        read_or_recover(&self.inner.registry)
            .get(model_id)
            .map(|e| e.record.status)
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        self.get_status(model_id) == Some(DownloadStatus::Downloading)
    }

    pub fn is_paused(&self, model_id: &str) -> bool {
        self.get_status(model_id) == Some(DownloadStatus::Paused)
    }

    /// Every tracked record, oldest first.
    pub fn list_downloads(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<DownloadRecord> = read_or_recover(&self.inner.registry)
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.model_id.cmp(&b.model_id)));
        records
    }

    /// Handle for observing a tracked download.
    pub fn subscribe(&self, model_id: &str) -> Option<DownloadHandle> {
        read_or_recover(&self.inner.registry)
            .get(model_id)
            .map(|e| e.handle())
    }

    /// Stop every live task as an external shutdown, wait for them to
    /// settle (leaving their records `Paused` on disk) and release waiters.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = write_or_recover(&self.inner.registry);
            for entry in registry.values() {
                if let Some(cancel) = &entry.cancel {
                    cancel.trigger(CancelReason::ExternalShutdown);
                }
            }
            self.inner.shutdown.cancel();

            let mut tasks: Vec<_> = registry.values_mut().filter_map(|e| e.task.take()).collect();
            tasks.extend(lock_or_recover(&self.inner.retired).drain().map(|(_, t)| t));
            tasks
        };

        tracing::info!("SHUTDOWN | tasks={}", tasks.len());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Download task ended abnormally during shutdown: {}", e);
            }
        }

        // Replacing the senders closes every waiter's channel
        let mut registry = write_or_recover(&self.inner.registry);
        for entry in registry.values_mut() {
            entry.cancel = None;
            entry.notify = watch::channel(entry.record.clone()).0;
        }
    }
}

impl Inner {
    /// Bump the generation and spawn a task for `entry`. Caller holds the
    /// registry lock.
    fn schedule(self: &Arc<Self>, entry: &mut Entry, resume: bool, sink: Option<ProgressSink>) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancelHandle::child_of(&self.shutdown);

        entry.generation = generation;
        entry.cancel = Some(cancel.clone());
        entry.last_persisted = Instant::now();

        let job = Job {
            model_id: entry.record.model_id.clone(),
            target_dir: entry.record.target_directory.clone(),
            generation,
            cancel,
            resume,
            sink,
            previous: entry.task.take(),
        };
        entry.task = Some(tokio::spawn(Arc::clone(self).run(job)));
    }

    async fn run(self: Arc<Self>, mut job: Job) {
        if let Some(previous) = job.previous.take() {
            let _ = previous.await;
        }

        let _permit = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                self.settle_cancelled(&job).await;
                return;
            }
            permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.settle_cancelled(&job).await;
                    return;
                }
            },
        };

        if !self.begin(&job) {
            if job.cancel.is_triggered() {
                self.settle_cancelled(&job).await;
            }
            return;
        }

        tracing::debug!(
            "TRANSFER_BEGIN | model_id={} resume={} source={}",
            job.model_id,
            job.resume,
            self.source.name()
        );
        let sink = self.progress_sink(&job);
        let token = job.cancel.token();
        let result = if job.resume {
            self.source.resume(&job.model_id, &job.target_dir, sink, token).await
        } else {
            self.source.download(&job.model_id, &job.target_dir, sink, token).await
        };

        if job.cancel.is_triggered() {
            self.settle_cancelled(&job).await;
            return;
        }
        match result {
            Ok(_) => self.settle_completed(&job).await,
            Err(e) if e.is_cancelled() => self.settle_cancelled(&job).await,
            Err(e) => self.settle_failed(&job, e).await,
        }
    }

    /// Move `Initializing` to `Downloading` if this task still owns the record.
    fn begin(&self, job: &Job) -> bool {
        let mut registry = write_or_recover(&self.registry);
        let Some(entry) = registry.get_mut(&job.model_id) else {
            return false;
        };
        if entry.generation != job.generation || job.cancel.is_triggered() {
            return false;
        }
        match entry.record.status {
            DownloadStatus::Initializing => {
                entry.record.transition(DownloadStatus::Downloading);
                entry.publish();
                true
            }
            DownloadStatus::Downloading => true,
            _ => false,
        }
    }

    fn progress_sink(self: &Arc<Self>, job: &Job) -> ProgressSink {
        let inner = Arc::clone(self);
        let model_id = job.model_id.clone();
        let generation = job.generation;
        let caller = job.sink.clone();

        Arc::new(move |report: &ProgressReport| {
            let (aggregate, persist) = {
                let mut registry = write_or_recover(&inner.registry);
                let Some(entry) = registry.get_mut(&model_id) else {
                    return;
                };
                // Late reports from a stopped or superseded task
                if entry.generation != generation || entry.record.status != DownloadStatus::Downloading {
                    return;
                }
                entry.record.apply_progress(report);
                entry.publish();

                let persist = entry.last_persisted.elapsed() >= PERSIST_INTERVAL;
                if persist {
                    entry.last_persisted = Instant::now();
                }
                let aggregate = ProgressReport {
                    file_name: report.file_name.clone(),
                    bytes_downloaded: entry.record.bytes_downloaded,
                    total_bytes: entry.record.total_bytes,
                    bytes_per_second: report.bytes_per_second,
                    eta: report.eta,
                    status: entry.record.status,
                };
                (aggregate, persist)
            };

            if persist {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let inner = Arc::clone(&inner);
                    let model_id = model_id.clone();
                    runtime.spawn(async move { inner.persist_logged(&model_id).await });
                }
            }
            if let Some(caller) = &caller {
                caller(&aggregate);
            }
        })
    }

    async fn settle_completed(&self, job: &Job) {
        let finished = {
            let mut registry = write_or_recover(&self.registry);
            let owned = registry.get(&job.model_id).map_or(false, |e| {
                e.generation == job.generation && e.record.status == DownloadStatus::Downloading
            });
            if !owned {
                return;
            }
            self.evict(&mut registry, &job.model_id).map(|mut entry| {
                entry.record.transition(DownloadStatus::Completed);
                if let Some(total) = entry.record.total_bytes {
                    entry.record.bytes_downloaded = entry.record.bytes_downloaded.max(total);
                }
                (entry.record, entry.notify)
            })
        };

        if let Some((record, notify)) = finished {
            self.forget(&job.model_id).await;
            tracing::info!(
                "DOWNLOAD_COMPLETED | model_id={} bytes={}",
                job.model_id,
                record.bytes_downloaded
            );
            notify.send_replace(record);
        }
    }

    async fn settle_failed(&self, job: &Job, error: DownloadError) {
        {
            let mut registry = write_or_recover(&self.registry);
            let Some(entry) = registry.get_mut(&job.model_id) else {
                return;
            };
            if entry.generation != job.generation || !entry.record.status.is_active() {
                return;
            }
            entry.record.message = Some(error.detail());
            entry.record.transition(DownloadStatus::Failed);
            entry.cancel = None;
        }

        tracing::warn!("DOWNLOAD_FAILED | model_id={} error={}", job.model_id, error);
        self.persist_logged(&job.model_id).await;
        self.publish(&job.model_id);
    }

    /// The task was stopped. User cancels were fully handled by
    /// `cancel_download`; pauses and shutdowns leave the record `Paused`.
    async fn settle_cancelled(&self, job: &Job) {
        let reason = job.cancel.settled_reason();
        if reason.resulting_status() == DownloadStatus::Cancelled {
            tracing::debug!("TASK_STOPPED | model_id={} reason={:?}", job.model_id, reason);
            return;
        }

        let changed = {
            let mut registry = write_or_recover(&self.registry);
            match registry.get_mut(&job.model_id) {
                Some(entry) if entry.generation == job.generation => {
                    entry.cancel = None;
                    entry.record.transition(DownloadStatus::Paused)
                }
                _ => false,
            }
        };

        tracing::debug!("TASK_STOPPED | model_id={} reason={:?}", job.model_id, reason);
        if changed {
            tracing::info!("DOWNLOAD_INTERRUPTED | model_id={} reason={:?}", job.model_id, reason);
            self.persist_logged(&job.model_id).await;
            self.publish(&job.model_id);
        }
    }

    fn publish(&self, model_id: &str) {
        if let Some(entry) = read_or_recover(&self.registry).get(model_id) {
            entry.publish();
        }
    }

    /// Remove an entry, keeping its task handle for the next task on the id.
    fn evict(&self, registry: &mut HashMap<String, Entry>, model_id: &str) -> Option<Entry> {
        let mut entry = registry.remove(model_id)?;
        entry.cancel = None;
        if let Some(task) = entry.task.take() {
            let mut retired = lock_or_recover(&self.retired);
            retired.retain(|_, t| !t.is_finished());
            retired.insert(model_id.to_string(), task);
        }
        Some(entry)
    }

    fn check_running(&self, model_id: &str) -> Result<(), DownloadError> {
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::ShuttingDown {
                model_id: model_id.to_string(),
            });
        }
        Ok(())
    }

    fn check_status(
        &self,
        model_id: &str,
        action: &'static str,
        allowed: impl Fn(DownloadStatus) -> bool,
    ) -> Result<(), DownloadError> {
        let registry = read_or_recover(&self.registry);
        let status = registry
            .get(model_id)
            .map(|e| e.record.status)
            .ok_or_else(|| not_tracked(model_id))?;
        if !allowed(status) {
            return Err(invalid(model_id, status, action));
        }
        Ok(())
    }

    /// Write the current in-memory record. Evicted ids are skipped, so a
    /// late write can never resurrect a deleted state file.
    async fn persist(&self, model_id: &str) -> Result<(), DownloadError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = match read_or_recover(&self.registry).get(model_id) {
            Some(entry) => entry.record.clone(),
            None => return Ok(()),
        };

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(DownloadError::persistence)?
            .map_err(DownloadError::persistence)
    }

    async fn persist_logged(&self, model_id: &str) {
        if let Err(e) = self.persist(model_id).await {
            tracing::warn!("STATE_SAVE_FAILED | model_id={} error={}", model_id, e);
        }
    }

    /// Delete the state file unless the id has been tracked again meanwhile.
    async fn forget(&self, model_id: &str) {
        let _guard = self.persist_lock.lock().await;
        if read_or_recover(&self.registry).contains_key(model_id) {
            return;
        }
        let store = self.store.clone();
        let id = model_id.to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || store.delete(&id)).await {
            tracing::warn!("STATE_DELETE_FAILED | model_id={} error={}", model_id, e);
        }
    }
}

fn tracked<'a>(
    registry: &'a mut HashMap<String, Entry>,
    model_id: &str,
) -> Result<&'a mut Entry, DownloadError> {
    registry.get_mut(model_id).ok_or_else(|| not_tracked(model_id))
}

fn not_tracked(model_id: &str) -> DownloadError {
    DownloadError::NotTracked {
        model_id: model_id.to_string(),
    }
}

fn invalid(model_id: &str, from: DownloadStatus, action: &'static str) -> DownloadError {
    DownloadError::InvalidTransition {
        model_id: model_id.to_string(),
        from,
        action,
    }
}
