// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for the orchestration tests.
//!
//! [`ScriptedSource`] is a [`SourceDownloader`] whose transfers are driven
//! by the test. Ids that have a script attached wait for [`Step`]s; every
//! other id downloads on its own after a short hold.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use modelpull::download::{
    DownloadStatus, ModelDescriptor, ModelFile, ModelKind, ModelRef, ProgressReport,
    ProgressSink, RepoDescriptor, SourceDownloader,
};
use modelpull::error::DownloadError;

pub const FILE_NAME: &str = "model.bin";
pub const DEFAULT_SIZE: u64 = 1000;

/// One instruction for a scripted transfer.
#[derive(Debug, Clone)]
pub enum Step {
    Progress { file: String, bytes: u64, total: u64 },
    Finish,
    Fail(String),
}

impl Step {
    pub fn progress(bytes: u64, total: u64) -> Self {
        Step::Progress {
            file: FILE_NAME.to_string(),
            bytes,
            total,
        }
    }
}

type Script = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>>;

#[derive(Default)]
pub struct Counters {
    pub downloads: AtomicUsize,
    pub resumes: AtomicUsize,
    pub pauses: AtomicUsize,
    pub cancels: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, (mpsc::UnboundedSender<Step>, Script)>>,
    sizes: Mutex<HashMap<String, u64>>,
    missing: Mutex<HashSet<String>>,
    live: Mutex<HashMap<String, usize>>,
    live_max: Mutex<HashMap<String, usize>>,
    active: Mutex<HashSet<String>>,
    hold: Duration,
    refuse_pause: AtomicBool,
    pub counters: Counters,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Self::with_hold(Duration::from_millis(50))
    }

    /// Unscripted transfers take roughly `hold` to finish.
    pub fn with_hold(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            sizes: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            live: Mutex::new(HashMap::new()),
            live_max: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            hold,
            refuse_pause: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Make `model_id` wait for steps instead of finishing on its own.
    pub fn script(&self, model_id: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .unwrap()
            .insert(model_id.to_string(), (tx, Arc::new(tokio::sync::Mutex::new(rx))));
    }

    pub fn step(&self, model_id: &str, step: Step) {
        let scripts = self.scripts.lock().unwrap();
        let (tx, _) = scripts.get(model_id).expect("model is not scripted");
        tx.send(step).expect("script receiver dropped");
    }

    pub fn set_size(&self, model_id: &str, size: u64) {
        self.sizes.lock().unwrap().insert(model_id.to_string(), size);
    }

    pub fn set_missing(&self, model_id: &str) {
        self.missing.lock().unwrap().insert(model_id.to_string());
    }

    pub fn refuse_pause(&self, refuse: bool) {
        self.refuse_pause.store(refuse, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> usize {
        self.counters.downloads.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.counters.resumes.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Most transfers ever running at once for one id.
    pub fn live_max(&self, model_id: &str) -> usize {
        self.live_max.lock().unwrap().get(model_id).copied().unwrap_or(0)
    }

    fn size_of(&self, model_id: &str) -> u64 {
        self.sizes
            .lock()
            .unwrap()
            .get(model_id)
            .copied()
            .unwrap_or(DEFAULT_SIZE)
    }

    fn descriptor(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        if self.missing.lock().unwrap().contains(model_id) {
            return Err(DownloadError::not_found(model_id));
        }
        let model = ModelRef::parse(model_id)?;
        let size = self.size_of(model_id);
        Ok(ModelDescriptor {
            model_id: model_id.to_string(),
            publisher: model.publisher.clone(),
            model_name: model.model.clone(),
            artifact_name: model.artifact_name().to_string(),
            kind: ModelKind::TextGeneration,
            files: vec![ModelFile {
                name: FILE_NAME.to_string(),
                size: Some(size),
            }],
            size_bytes: Some(size),
            local_path: None,
            downloaded_at: None,
        })
    }

    async fn transfer(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        let _live = LiveGuard::enter(self, model_id);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(model_id)
            .map(|(_, rx)| Arc::clone(rx));

        match script {
            Some(script) => {
                let mut steps = script.lock().await;
                loop {
                    let step = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::cancelled(model_id)),
                        step = steps.recv() => step,
                    };
                    match step {
                        Some(Step::Progress { file, bytes, total }) => {
                            progress(&ProgressReport::new(file, bytes, Some(total)));
                        }
                        Some(Step::Finish) => break,
                        Some(Step::Fail(message)) => {
                            return Err(DownloadError::transfer(model_id, message))
                        }
                        None => return Err(DownloadError::transfer(model_id, "script closed")),
                    }
                }
            }
            None => {
                let total = self.size_of(model_id);
                for chunk in 1..=2u64 {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::cancelled(model_id)),
                        _ = tokio::time::sleep(self.hold / 2) => {}
                    }
                    progress(&ProgressReport::new(FILE_NAME, total * chunk / 2, Some(total)));
                }
            }
        }

        tokio::fs::create_dir_all(target_dir).await?;
        tokio::fs::write(target_dir.join(FILE_NAME), b"weights").await?;
        self.descriptor(model_id)
    }
}

/// Tracks how many transfers are running, overall and per id.
struct LiveGuard<'a> {
    source: &'a ScriptedSource,
    model_id: String,
}

impl<'a> LiveGuard<'a> {
    fn enter(source: &'a ScriptedSource, model_id: &str) -> Self {
        let now = source.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        source.counters.peak.fetch_max(now, Ordering::SeqCst);

        let mut live = source.live.lock().unwrap();
        let count = live.entry(model_id.to_string()).or_insert(0);
        *count += 1;
        let mut live_max = source.live_max.lock().unwrap();
        let max = live_max.entry(model_id.to_string()).or_insert(0);
        *max = (*max).max(*count);

        source.active.lock().unwrap().insert(model_id.to_string());
        Self {
            source,
            model_id: model_id.to_string(),
        }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.source.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut live = self.source.live.lock().unwrap();
        if let Some(count) = live.get_mut(&self.model_id) {
            *count -= 1;
            if *count == 0 {
                self.source.active.lock().unwrap().remove(&self.model_id);
            }
        }
    }
}

#[async_trait]
impl SourceDownloader for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn can_handle(&self, model_id: &str) -> bool {
        model_id.starts_with("hf:")
    }

    async fn download(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.counters.downloads.fetch_add(1, Ordering::SeqCst);
        self.transfer(model_id, target_dir, progress, cancel).await
    }

    async fn resume(
        &self,
        model_id: &str,
        target_dir: &Path,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ModelDescriptor, DownloadError> {
        self.counters.resumes.fetch_add(1, Ordering::SeqCst);
        self.transfer(model_id, target_dir, progress, cancel).await
    }

    async fn pause(&self, _model_id: &str) -> bool {
        self.counters.pauses.fetch_add(1, Ordering::SeqCst);
        !self.refuse_pause.load(Ordering::SeqCst)
    }

    async fn cancel(&self, _model_id: &str) -> bool {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn get_status(&self, model_id: &str) -> Option<DownloadStatus> {
        self.active
            .lock()
            .unwrap()
            .contains(model_id)
            .then_some(DownloadStatus::Downloading)
    }

    async fn get_model_info(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        self.descriptor(model_id)
    }

    async fn get_repository_info(&self, repo_id: &str) -> Result<RepoDescriptor, DownloadError> {
        Ok(RepoDescriptor {
            repo_id: repo_id.trim_start_matches("hf:").to_string(),
            author: None,
            kind: ModelKind::TextGeneration,
            downloads: 0,
            likes: 0,
            last_modified: None,
            files: Vec::new(),
            gated: false,
        })
    }

    async fn search_repositories(
        &self,
        _kind: Option<ModelKind>,
        _term: &str,
        _limit: usize,
    ) -> Result<Vec<RepoDescriptor>, DownloadError> {
        Ok(Vec::new())
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
