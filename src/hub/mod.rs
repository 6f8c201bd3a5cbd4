// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model hub source.
//!
//! Handles `hf:publisher/model[/artifact]` ids against a Hugging Face
//! compatible REST API. Files stream into `{name}.part` and are renamed
//! when complete, so a paused or interrupted transfer resumes with a
//! `Range` request from the partial length.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::download::model_id::ModelRef;
use crate::download::source::{ProgressSink, SourceDownloader};
use crate::download::types::{
    DownloadStatus, ModelDescriptor, ModelFile, ModelKind, ProgressReport, RepoDescriptor,
};
use crate::error::DownloadError;
use crate::locks::lock_or_recover;

/// Registry prefix handled by this source.
pub const REGISTRY: &str = "hf";

/// Default public hub.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Connection timeout for hub requests (30 seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Timeout for catalog (JSON) requests.
const API_TIMEOUT_SECS: u64 = 60;

/// Minimum spacing between progress reports for one file.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Repository metadata as returned by `/api/models`.
#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(rename = "lastModified", default)]
    last_modified: Option<String>,
    #[serde(default)]
    siblings: Vec<ApiSibling>,
    /// `false`, `"auto"` or `"manual"`
    #[serde(default)]
    gated: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiSibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

impl From<ApiModel> for RepoDescriptor {
    fn from(api: ApiModel) -> Self {
        let gated = !matches!(api.gated, serde_json::Value::Null | serde_json::Value::Bool(false));
        RepoDescriptor {
            repo_id: api.id,
            author: api.author,
            kind: ModelKind::from_pipeline_tag(api.pipeline_tag.as_deref()),
            downloads: api.downloads,
            likes: api.likes,
            last_modified: api.last_modified,
            files: api
                .siblings
                .into_iter()
                .map(|s| ModelFile {
                    name: s.rfilename,
                    size: s.size,
                })
                .collect(),
            gated,
        }
    }
}

/// `SourceDownloader` for a Hugging Face compatible hub.
pub struct HubSource {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    /// Ids with a transfer in flight
    active: Mutex<HashSet<String>>,
    /// Ids whose partial files should be removed when their transfer stops
    discard: Mutex<HashSet<String>>,
    /// Where each unfinished transfer keeps its partial files
    targets: Mutex<HashMap<String, (PathBuf, Vec<ModelFile>)>>,
}

impl HubSource {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        user_agent: &str,
    ) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::io(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            active: Mutex::new(HashSet::new()),
            discard: Mutex::new(HashSet::new()),
            targets: Mutex::new(HashMap::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Mark a transfer as running. A discard request left over from an
    /// earlier transfer of the same id no longer applies.
    fn begin_transfer(&self, model_id: &str, target_dir: &Path, files: &[ModelFile]) {
        let mut active = lock_or_recover(&self.active);
        active.insert(model_id.to_string());
        lock_or_recover(&self.discard).remove(model_id);
        lock_or_recover(&self.targets)
            .insert(model_id.to_string(), (target_dir.to_path_buf(), files.to_vec()));
    }

    /// Mark a transfer as stopped and report whether its partial files
    /// should be discarded.
    fn end_transfer(&self, model_id: &str, completed: bool) -> bool {
        let mut active = lock_or_recover(&self.active);
        active.remove(model_id);
        let discard = lock_or_recover(&self.discard).remove(model_id);
        if completed || discard {
            lock_or_recover(&self.targets).remove(model_id);
        }
        discard
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_repo(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError> {
        let url = format!("{}/api/models/{}", self.endpoint, repo_id);
        let response = self
            .get(&url)
            .query(&[("blobs", "true")])
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| DownloadError::transfer(repo_id, e.to_string()))?;
        let response = check_response(repo_id, response)?;

        let api: ApiModel = response
            .json()
            .await
            .map_err(|e| DownloadError::transfer(repo_id, format!("invalid catalog response: {}", e)))?;
        Ok(api.into())
    }

    async fn transfer(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
        fresh: bool,
    ) -> Result<ModelDescriptor, DownloadError> {
        let model = ModelRef::parse(model_id)?;
        let info = self.get_model_info(model_id).await?;
        tokio::fs::create_dir_all(target_dir).await?;

        self.begin_transfer(model_id, target_dir, &info.files);
        let mut result = Ok(());
        for file in &info.files {
            result = self
                .fetch_file(&model, file, target_dir, info.size_bytes, &progress, &cancel, fresh)
                .await;
            if result.is_err() {
                break;
            }
        }
        if self.end_transfer(model_id, result.is_ok()) {
            remove_partials(target_dir, &info.files).await;
        }
        result.map(|_| info)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_file(
        &self,
        model: &ModelRef,
        file: &ModelFile,
        target_dir: &Path,
        model_total: Option<u64>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        fresh: bool,
    ) -> Result<(), DownloadError> {
        let model_id = model.to_string();
        let dest = target_dir.join(&file.name);
        let part = part_path(&dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let (Ok(meta), Some(size)) = (tokio::fs::metadata(&dest).await, file.size) {
            if meta.len() == size {
                progress(&report(&file.name, size, model_total, None, None));
                return Ok(());
            }
        }

        if fresh {
            discard_part(&part).await?;
        }
        let mut resume_from = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        if let Some(size) = file.size {
            if resume_from > size {
                discard_part(&part).await?;
                resume_from = 0;
            } else if resume_from == size && size > 0 {
                tokio::fs::rename(&part, &dest).await?;
                progress(&report(&file.name, size, model_total, None, None));
                return Ok(());
            }
        }

        let url = format!("{}/{}/resolve/main/{}", self.endpoint, model.repo_id(), file.name);
        let mut request = self.get(&url);
        if resume_from > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::cancelled(&model_id)),
            sent = request.send() => sent.map_err(|e| DownloadError::transfer(&model_id, e.to_string()))?,
        };
        let response = check_response(&model_id, response)?;

        let resuming = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        if resuming && !content_range_starts_at(resume_from, response.headers()) {
            if let Err(e) = discard_part(&part).await {
                tracing::warn!("PARTIAL_REMOVE_FAILED | path={:?} error={}", part, e);
            }
            return Err(DownloadError::transfer(
                &model_id,
                "server returned a mismatched Content-Range for resume",
            ));
        }
        if resume_from > 0 && !resuming {
            tracing::debug!("RANGE_IGNORED | model_id={} file={}", model_id, file.name);
            resume_from = 0;
        }

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(&part)
            .await?;

        let mut downloaded = resume_from;
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut last_report = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    out.flush().await?;
                    tracing::debug!("TRANSFER_STOPPED | model_id={} file={} bytes={}", model_id, file.name, downloaded);
                    return Err(DownloadError::cancelled(&model_id));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| DownloadError::transfer(&model_id, e.to_string()))?;
            out.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                let elapsed = started.elapsed().as_secs_f64();
                let speed = (elapsed > 0.0).then(|| (downloaded - resume_from) as f64 / elapsed);
                let eta = match (speed, file.size) {
                    (Some(bps), Some(size)) if bps > 0.0 => {
                        Some(Duration::from_secs_f64(size.saturating_sub(downloaded) as f64 / bps))
                    }
                    _ => None,
                };
                progress(&report(&file.name, downloaded, model_total, speed, eta));
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if let Some(size) = file.size {
            if downloaded != size {
                return Err(DownloadError::transfer(
                    &model_id,
                    format!("{} ended after {} of {} bytes", file.name, downloaded, size),
                ));
            }
        }
        tokio::fs::rename(&part, &dest).await?;
        progress(&report(&file.name, downloaded, model_total, None, None));
        Ok(())
    }
}

#[async_trait]
impl SourceDownloader for HubSource {
    fn name(&self) -> &str {
        "hub"
    }

    fn can_handle(&self, model_id: &str) -> bool {
        model_id
            .split_once(':')
            .map(|(registry, _)| registry.eq_ignore_ascii_case(REGISTRY))
            .unwrap_or(false)
    }

    async fn download(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.transfer(model_id, target_dir, progress, cancel, true).await
    }

    async fn resume(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.transfer(model_id, target_dir, progress, cancel, false).await
    }

    /// Partial files are kept; the transfer stops when its token fires.
    async fn pause(&self, _model_id: &str) -> bool {
        true
    }

    /// A running transfer drops its partial files when it stops; a stopped
    /// one seen by this process has them removed now.
    async fn cancel(&self, model_id: &str) -> bool {
        let running = {
            let active = lock_or_recover(&self.active);
            let running = active.contains(model_id);
            if running {
                lock_or_recover(&self.discard).insert(model_id.to_string());
            }
            running
        };
        if !running {
            let stopped = lock_or_recover(&self.targets).remove(model_id);
            if let Some((target_dir, files)) = stopped {
                remove_partials(&target_dir, &files).await;
            }
        }
        true
    }

    async fn get_status(&self, model_id: &str) -> Option<DownloadStatus> {
        lock_or_recover(&self.active)
            .contains(model_id)
            .then_some(DownloadStatus::Downloading)
    }

    async fn get_model_info(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        let model = ModelRef::parse(model_id)?;
        let repo = self.fetch_repo(&model.repo_id()).await?;

        let files = select_files(&repo.files, model.artifact.as_deref());
        if files.is_empty() {
            return Err(DownloadError::not_found(model_id));
        }
        let size_bytes = files.iter().map(|f| f.size).sum::<Option<u64>>();

        Ok(ModelDescriptor {
            model_id: model.to_string(),
            publisher: model.publisher.clone(),
            model_name: model.model.clone(),
            artifact_name: model.artifact_name().to_string(),
            kind: repo.kind,
            files,
            size_bytes,
            local_path: None,
            downloaded_at: None,
        })
    }

    async fn get_repository_info(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError> {
        let repo = repo_id
            .strip_prefix(REGISTRY)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(repo_id);
        self.fetch_repo(repo).await
    }

    async fn search_repositories(
        &self,
        kind: Option<ModelKind>,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RepoDescriptor>, DownloadError> {
        let url = format!("{}/api/models", self.endpoint);
        let limit = limit.to_string();
        let mut query = vec![
            ("search", term),
            ("limit", limit.as_str()),
            ("sort", "downloads"),
            ("direction", "-1"),
        ];
        if let Some(tag) = kind.and_then(|k| k.pipeline_tag()) {
            query.push(("pipeline_tag", tag));
        }

        let response = self
            .get(&url)
            .query(&query)
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| DownloadError::transfer(term, e.to_string()))?;
        let response = check_response(term, response)?;
        let found: Vec<ApiModel> = response
            .json()
            .await
            .map_err(|e| DownloadError::transfer(term, format!("invalid search response: {}", e)))?;

        Ok(found.into_iter().map(RepoDescriptor::from).collect())
    }
}

/// Map an unsuccessful response onto the error taxonomy.
fn status_error(model_id: &str, status: StatusCode) -> Option<DownloadError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DownloadError::authentication_required(model_id)
        }
        StatusCode::NOT_FOUND => DownloadError::not_found(model_id),
        other => DownloadError::transfer(model_id, format!("HTTP {}", other)),
    })
}

fn check_response(
    model_id: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DownloadError> {
    match status_error(model_id, response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

/// Files making up the requested artifact. With no artifact, every file
/// except repository housekeeping is selected.
fn select_files(files: &[ModelFile], artifact: Option<&str>) -> Vec<ModelFile> {
    files
        .iter()
        .filter(|f| is_safe_relative(&f.name))
        .filter(|f| match artifact {
            Some(wanted) => {
                let path = Path::new(&f.name);
                let stem = path.file_stem().and_then(|s| s.to_str());
                let name = path.file_name().and_then(|s| s.to_str());
                stem == Some(wanted) || name == Some(wanted)
            }
            None => !f.name.rsplit('/').next().unwrap_or("").starts_with('.'),
        })
        .cloned()
        .collect()
}

fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn content_range_starts_at(offset: u64, headers: &header::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes "))
        .and_then(|rest| rest.split('-').next())
        .and_then(|start| start.parse::<u64>().ok())
        .map(|start| start == offset)
        .unwrap_or(false)
}

fn report(
    file_name: &str,
    bytes: u64,
    total: Option<u64>,
    bytes_per_second: Option<f64>,
    eta: Option<Duration>,
) -> ProgressReport {
    ProgressReport {
        bytes_per_second,
        eta,
        ..ProgressReport::new(file_name, bytes, total)
    }
}

/// Remove a partial file; a missing one counts as removed.
async fn discard_part(part: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {
            tracing::debug!("PARTIAL_REMOVED | path={:?}", part);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_partials(target_dir: &Path, files: &[ModelFile]) {
    for file in files {
        let part = part_path(&target_dir.join(&file.name));
        if let Err(e) = discard_part(&part).await {
            tracing::warn!("PARTIAL_REMOVE_FAILED | path={:?} error={}", part, e);
        }
    }
}
