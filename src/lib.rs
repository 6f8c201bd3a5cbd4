// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelpull - resumable model download library
//!
//! Pull models from remote hubs with a bounded number of concurrent
//! transfers, pause and resume them, and pick up where you left off after
//! a crash or restart.
//!
//! **ModelManager** -> **DownloadManager** -> **SourceDownloader**
//!
//! # Core Modules
//!
//! - [`download`] - Orchestration, state files, model layout and the source contract
//! - [`hub`] - Hugging Face style hub source
//! - [`config`] - Configuration file and environment overrides
//! - [`error`] - Download error type and failure classification
//! - [`locks`] - Lock helpers that recover from poisoning
//! - [`utils`] - Id sanitizing and human-readable formatting

pub mod config;
pub mod download;
pub mod error;
pub mod hub;
pub mod locks;
pub mod utils;

// Re-export commonly used types from download
pub use download::{
    CancelReason, DownloadHandle, DownloadManager, DownloadRecord, DownloadStatus,
    ModelDescriptor, ModelKind, ModelManager, ModelRef, ProgressReport, ProgressSink,
    RepoDescriptor, SourceDownloader, SourceRouter, StateStore,
};

// Re-export from other modules
pub use config::Config;
pub use error::{DownloadError, FailureKind};
pub use hub::HubSource;
