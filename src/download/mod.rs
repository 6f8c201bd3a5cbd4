// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration for modelpull
//!
//! This module provides resumable model downloads with:
//! - A global bound on concurrent transfers
//! - Pause, resume and cancel with an explicit reason per cancellation
//! - Per-model state files that survive restarts (recovered as paused)
//! - Deduplicated "download and wait" for concurrent callers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ ModelManager    │────▶│ DownloadManager │────▶│ SourceDownloader │
//! │ (dedup + wait)  │     │ (tasks + gate)  │     │ (HubSource, ...) │
//! └────────┬────────┘     └────────┬────────┘     └──────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ ModelLayout     │     │ StateStore      │
//! │ (models/...)    │     │ (.downloads/)   │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelpull::download::{ModelManager, SourceRouter};
//! use modelpull::hub::HubSource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = HubSource::new("https://huggingface.co", None, "modelpull")?;
//! let source = Arc::new(SourceRouter::new().with_source(Arc::new(hub)));
//! let models = ModelManager::new(source, "/tmp/modelpull", 2, None)?;
//!
//! let model = models.download_and_wait("hf:acme/model-x", None).await?;
//! println!("Downloaded to {:?}", model.local_path);
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod model_id;
pub mod cancel;
pub mod source;
pub mod state;
pub mod layout;
pub mod manager;
pub mod facade;

// Re-export commonly used items
pub use types::{
    CancelReason, DownloadRecord, DownloadStatus, ModelDescriptor, ModelFile, ModelKind,
    ProgressReport, RepoDescriptor,
};
pub use model_id::ModelRef;
pub use cancel::CancelHandle;
pub use source::{noop_sink, ProgressSink, SourceDownloader, SourceRouter};
pub use state::StateStore;
pub use layout::ModelLayout;
pub use manager::{DownloadHandle, DownloadManager};
pub use facade::ModelManager;
