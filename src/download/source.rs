// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The contract between the orchestrator and whatever actually moves bytes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{DownloadStatus, ModelDescriptor, ModelKind, ProgressReport, RepoDescriptor};
use crate::error::DownloadError;

/// Progress callback handed to sources and to callers of the orchestrator.
pub type ProgressSink = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// A sink that drops every report.
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_: &ProgressReport| {})
}

/// A source-specific downloader (one per external registry).
///
/// `download` and `resume` must watch `cancel` and return
/// `DownloadError::Cancelled` promptly once it fires, leaving partial data
/// in place so a later `resume` can pick it up.
#[async_trait]
pub trait SourceDownloader: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether this source understands the identifier.
    fn can_handle(&self, model_id: &str) -> bool;

    /// Transfer the model into `target_dir`.
    async fn download(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError>;

    /// Continue a transfer from whatever is already in `target_dir`.
    async fn resume(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError>;

    /// Pause at the transport level. `false` means the source refused.
    async fn pause(&self, model_id: &str) -> bool;

    /// Cancel at the transport level and discard partial data.
    async fn cancel(&self, model_id: &str) -> bool;

    /// What the source itself believes, independent of the orchestrator.
    async fn get_status(&self, model_id: &str) -> Option<DownloadStatus>;

    async fn get_model_info(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError>;

    async fn get_repository_info(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError>;

    async fn search_repositories(
        &self,
        kind: Option<ModelKind>,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RepoDescriptor>, DownloadError>;
}

/// Dispatches to the first registered source that can handle an id.
#[derive(Clone, Default)]
pub struct SourceRouter {
    sources: Vec<Arc<dyn SourceDownloader>>,
}

impl SourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn SourceDownloader>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn route(&self, model_id: &str) -> Result<&Arc<dyn SourceDownloader>, DownloadError> {
        self.sources
            .iter()
            .find(|s| s.can_handle(model_id))
            .ok_or_else(|| DownloadError::not_found(model_id))
    }
}

#[async_trait]
impl SourceDownloader for SourceRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn can_handle(&self, model_id: &str) -> bool {
        self.sources.iter().any(|s| s.can_handle(model_id))
    }

    async fn download(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.route(model_id)?
            .download(model_id, target_dir, progress, cancel)
            .await
    }

    async fn resume(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.route(model_id)?
            .resume(model_id, target_dir, progress, cancel)
            .await
    }

    async fn pause(&self, model_id: &str) -> bool {
        match self.route(model_id) {
            Ok(source) => source.pause(model_id).await,
            Err(_) => false,
        }
    }

    async fn cancel(&self, model_id: &str) -> bool {
        match self.route(model_id) {
            Ok(source) => source.cancel(model_id).await,
            Err(_) => false,
        }
    }

    async fn get_status(&self, model_id: &str) -> Option<DownloadStatus> {
        self.route(model_id).ok()?.get_status(model_id).await
    }

    async fn get_model_info(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        self.route(model_id)?.get_model_info(model_id).await
    }

    async fn get_repository_info(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError> {
        self.route(repo_id)?.get_repository_info(repo_id).await
    }

    /// Searches every source and concatenates the results. Fails only if
    /// every source failed.
    async fn search_repositories(
        &self,
        kind: Option<ModelKind>,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RepoDescriptor>, DownloadError> {
        let mut results = Vec::new();
        let mut first_error = None;

        for source in &self.sources {
            match source.search_repositories(kind, term, limit).await {
                Ok(mut found) => results.append(&mut found),
                Err(e) => {
                    tracing::warn!("SEARCH_FAILED | source={} error={}", source.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if results.is_empty() => Err(e),
            _ => {
                results.truncate(limit);
                Ok(results)
            }
        }
    }
}
