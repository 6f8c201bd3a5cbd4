// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Caller-facing model manager.
//!
//! Wraps the [`DownloadManager`] with request deduplication, a local
//! fast path and a "download and wait" call that resolves to the
//! materialized [`ModelDescriptor`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use super::layout::{ensure_space, ModelLayout};
use super::manager::{DownloadHandle, DownloadManager};
use super::model_id::ModelRef;
use super::source::{ProgressSink, SourceDownloader};
use super::state::StateStore;
use super::types::{DownloadRecord, DownloadStatus, ModelDescriptor, ModelKind, RepoDescriptor};
use crate::error::DownloadError;
use crate::locks::lock_or_recover;

type SharedFetch = Shared<BoxFuture<'static, Result<ModelDescriptor, DownloadError>>>;

struct Inner {
    downloads: DownloadManager,
    source: Arc<dyn SourceDownloader>,
    layout: ModelLayout,
    wait_timeout: Option<Duration>,
    /// In-flight fetches by model id, tagged so a finished fetch only
    /// removes its own entry
    inflight: Mutex<HashMap<String, (u64, SharedFetch)>>,
    tickets: AtomicU64,
}

/// The operations a CLI or API layer is expected to call.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    /// Build a manager storing state and models under `base_dir`.
    pub fn new(
        source: Arc<dyn SourceDownloader>,
        base_dir: impl AsRef<Path>,
        max_concurrent: usize,
        wait_timeout: Option<Duration>,
    ) -> Result<Self, DownloadError> {
        let base_dir = base_dir.as_ref();
        let downloads = DownloadManager::new(
            Arc::clone(&source),
            StateStore::new(base_dir),
            max_concurrent,
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                downloads,
                source,
                layout: ModelLayout::new(base_dir),
                wait_timeout,
                inflight: Mutex::new(HashMap::new()),
                tickets: AtomicU64::new(0),
            }),
        })
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.inner.downloads
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.inner.layout
    }

    /// Download `model_id` (or find it locally) and wait for the result.
    ///
    /// Concurrent calls for the same id share one download and one outcome;
    /// only the first caller's progress sink receives reports. The download
    /// keeps running if the caller stops waiting.
    pub async fn download_and_wait(
        &self,
        model_id: &str,
        progress: Option<ProgressSink>,
    ) -> Result<ModelDescriptor, DownloadError> {
        let fetch = {
            let mut inflight = lock_or_recover(&self.inner.inflight);
            match inflight.get(model_id) {
                Some((_, existing)) => {
                    tracing::debug!("DOWNLOAD_JOINED | model_id={}", model_id);
                    existing.clone()
                }
                None => {
                    let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst);
                    let fetch = self.inner.spawn_fetch(model_id, ticket, progress);
                    inflight.insert(model_id.to_string(), (ticket, fetch.clone()));
                    fetch
                }
            }
        };

        fetch.await
    }

    pub async fn pause(&self, model_id: &str) -> Result<DownloadRecord, DownloadError> {
        self.inner.downloads.pause_download(model_id).await
    }

    pub async fn resume(
        &self,
        model_id: &str,
        progress: Option<ProgressSink>,
    ) -> Result<DownloadHandle, DownloadError> {
        self.inner.downloads.resume_download(model_id, progress).await
    }

    /// Cancel a download. Callers already waiting see `Cancelled`; the next
    /// `download_and_wait` starts over.
    pub async fn cancel(&self, model_id: &str) -> Result<DownloadRecord, DownloadError> {
        let record = self.inner.downloads.cancel_download(model_id).await?;
        lock_or_recover(&self.inner.inflight).remove(model_id);
        Ok(record)
    }

    pub fn get_status(&self, model_id: &str) -> Option<DownloadStatus> {
        self.inner.downloads.get_status(model_id)
    }

    pub fn get_record(&self, model_id: &str) -> Option<DownloadRecord> {
        self.inner.downloads.get_record(model_id)
    }

    /// Every tracked download, including ones recovered from disk.
    pub fn list_active_downloads(&self) -> Vec<DownloadRecord> {
        self.inner.downloads.list_downloads()
    }

    /// Locally available copy of a model, if any.
    pub fn find_local(&self, model_id: &str) -> Result<Option<ModelDescriptor>, DownloadError> {
        let model = ModelRef::parse(model_id)?;
        Ok(self.inner.layout.find_local(&model))
    }

    pub async fn model_info(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        ModelRef::parse(model_id)?;
        self.inner.source.get_model_info(model_id).await
    }

    pub async fn repository_info(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError> {
        self.inner.source.get_repository_info(repo_id).await
    }

    pub async fn search(
        &self,
        kind: Option<ModelKind>,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RepoDescriptor>, DownloadError> {
        self.inner.source.search_repositories(kind, term, limit).await
    }

    /// Stop every live download, leaving them paused and resumable.
    pub async fn shutdown(&self) {
        self.inner.downloads.shutdown().await
    }
}

impl Inner {
    /// Run the fetch as its own task so it settles, and leaves `inflight`,
    /// even when every caller has stopped waiting. Caller holds `inflight`.
    fn spawn_fetch(
        self: &Arc<Self>,
        model_id: &str,
        ticket: u64,
        progress: Option<ProgressSink>,
    ) -> SharedFetch {
        let inner = Arc::clone(self);
        let id = model_id.to_string();
        let task = tokio::spawn(async move {
            let result = inner.fetch(&id, progress).await;
            let mut inflight = lock_or_recover(&inner.inflight);
            if inflight.get(&id).map_or(false, |(t, _)| *t == ticket) {
                inflight.remove(&id);
            }
            result
        });

        let model_id = model_id.to_string();
        task.map(move |joined| {
            joined.unwrap_or_else(|e| {
                tracing::error!("FETCH_TASK_FAILED | model_id={} error={}", model_id, e);
                Err(DownloadError::io(format!(
                    "download task for '{}' ended abnormally: {}",
                    model_id, e
                )))
            })
        })
        .boxed()
        .shared()
    }

    async fn fetch(
        &self,
        model_id: &str,
        progress: Option<ProgressSink>,
    ) -> Result<ModelDescriptor, DownloadError> {
        let model = ModelRef::parse(model_id)?;

        if let Some(local) = self.layout.find_local(&model) {
            tracing::info!("MODEL_ALREADY_LOCAL | model_id={}", model_id);
            return Ok(local);
        }

        let info = self.source.get_model_info(model_id).await?;
        let target_dir = self.layout.model_dir(info.kind, &model);

        if let Some(required) = info.size_bytes {
            let already = self
                .downloads
                .get_record(model_id)
                .map(|r| r.bytes_downloaded)
                .unwrap_or(0);
            ensure_space(&target_dir, required.saturating_sub(already))?;
        }

        let mut handle = self
            .downloads
            .start_download(model_id, info.kind, &target_dir, progress)
            .await?;

        let record = match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, handle.wait())
                .await
                .map_err(|_| DownloadError::Timeout {
                    model_id: model_id.to_string(),
                    waited: limit,
                })?,
            None => handle.wait().await,
        };

        match record.status {
            DownloadStatus::Completed => self
                .layout
                .materialize(&model, info, &target_dir)
                .map_err(DownloadError::persistence),
            DownloadStatus::Cancelled => Err(DownloadError::cancelled(model_id)),
            DownloadStatus::Failed => Err(DownloadError::transfer(
                model_id,
                record
                    .message
                    .unwrap_or_else(|| "source reported an unknown error".to_string()),
            )),
            status => Err(DownloadError::Interrupted {
                model_id: model_id.to_string(),
                status,
            }),
        }
    }
}
