// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the orchestrator, the state store and sources.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a tracked download.
///
/// ```text
/// Initializing ──▶ Downloading ──▶ Completed
///      │   ▲           │  ▲
///      │   │           ▼  │
///      │   │         Paused ──▶ Cancelled
///      ▼   │
///    Failed / Cancelled ──(restart)──▶ Initializing
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Registered, waiting for a concurrency slot
    Initializing,
    /// Transfer in progress
    Downloading,
    /// Stopped, resumable
    Paused,
    /// Cancelled by the user
    Cancelled,
    /// Successfully completed
    Completed,
    /// Transfer error; record kept for inspection or restart
    Failed,
}

impl DownloadStatus {
    /// Returns true for statuses that end the record's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }

    /// Returns true once the task behind the record has stopped for good.
    ///
    /// `Failed` is settled but not terminal: the record stays around.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Cancelled | DownloadStatus::Failed
        )
    }

    /// Returns true if a task is scheduled or transferring.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Initializing | DownloadStatus::Downloading)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Initializing, Downloading)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Initializing, Paused)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Downloading, Cancelled)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Failed, Initializing)
                | (Cancelled, Initializing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Initializing => "initializing",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a live task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserPause,
    UserCancel,
    /// Process shutdown or an outer token; leaves the download resumable.
    ExternalShutdown,
}

impl CancelReason {
    /// Status a download settles in after being stopped for this reason.
    pub fn resulting_status(&self) -> DownloadStatus {
        match self {
            CancelReason::UserCancel => DownloadStatus::Cancelled,
            CancelReason::UserPause | CancelReason::ExternalShutdown => DownloadStatus::Paused,
        }
    }
}

/// Coarse model category, used for the on-disk layout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    #[default]
    TextGeneration,
    Embedding,
    SpeechToText,
    TextToSpeech,
    ImageGeneration,
    Other,
}

impl ModelKind {
    pub const ALL: [ModelKind; 6] = [
        ModelKind::TextGeneration,
        ModelKind::Embedding,
        ModelKind::SpeechToText,
        ModelKind::TextToSpeech,
        ModelKind::ImageGeneration,
        ModelKind::Other,
    ];

    /// Directory name under `models/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ModelKind::TextGeneration => "text-generation",
            ModelKind::Embedding => "embedding",
            ModelKind::SpeechToText => "speech-to-text",
            ModelKind::TextToSpeech => "text-to-speech",
            ModelKind::ImageGeneration => "image-generation",
            ModelKind::Other => "other",
        }
    }

    /// Hub `pipeline_tag` used when filtering searches. `Other` has none.
    pub fn pipeline_tag(&self) -> Option<&'static str> {
        match self {
            ModelKind::TextGeneration => Some("text-generation"),
            ModelKind::Embedding => Some("feature-extraction"),
            ModelKind::SpeechToText => Some("automatic-speech-recognition"),
            ModelKind::TextToSpeech => Some("text-to-speech"),
            ModelKind::ImageGeneration => Some("text-to-image"),
            ModelKind::Other => None,
        }
    }

    /// Map a hub `pipeline_tag` onto a kind.
    pub fn from_pipeline_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("text-generation") | Some("text2text-generation") | Some("conversational") => {
                ModelKind::TextGeneration
            }
            Some("feature-extraction") | Some("sentence-similarity") => ModelKind::Embedding,
            Some("automatic-speech-recognition") => ModelKind::SpeechToText,
            Some("text-to-speech") | Some("text-to-audio") => ModelKind::TextToSpeech,
            Some("text-to-image") => ModelKind::ImageGeneration,
            _ => ModelKind::Other,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        ModelKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.dir_name() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = ModelKind::ALL.iter().map(|k| k.dir_name()).collect();
                format!("unknown model kind '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// The orchestrator's unit of work, both in memory and on disk.
///
/// The cancellation handle for a live task is kept by the orchestrator next
/// to the record, never inside it, so a serialized record cannot carry one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    /// Primary key, e.g. `hf:acme/model-x`
    pub model_id: String,
    /// Where the artifact files land
    pub target_directory: PathBuf,
    pub model_kind: ModelKind,
    pub status: DownloadStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Known once the source has reported it
    pub total_bytes: Option<u64>,
    pub bytes_downloaded: u64,
    /// Per-file byte counts, summed into `bytes_downloaded`
    #[serde(default)]
    pub downloaded_files: BTreeMap<String, u64>,
    /// Opaque source bookkeeping
    #[serde(default)]
    pub provider_data: BTreeMap<String, String>,
    /// Last error or status note
    #[serde(default)]
    pub message: Option<String>,
}

impl DownloadRecord {
    /// Create a fresh record in `Initializing`.
    pub fn new(model_id: impl Into<String>, kind: ModelKind, target_directory: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            model_id: model_id.into(),
            target_directory: target_directory.into(),
            model_kind: kind,
            status: DownloadStatus::Initializing,
            started_at: now,
            last_updated_at: now,
            total_bytes: None,
            bytes_downloaded: 0,
            downloaded_files: BTreeMap::new(),
            provider_data: BTreeMap::new(),
            message: None,
        }
    }

    /// Update the status and timestamp without checking the state machine.
    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
        self.last_updated_at = Utc::now();
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: DownloadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.set_status(next);
        true
    }

    /// Fold a progress report into the per-file counts.
    ///
    /// Per-file counts never go backwards, so the aggregate is
    /// non-decreasing across pause/resume even if a source re-reports
    /// a file from an earlier offset.
    pub fn apply_progress(&mut self, report: &ProgressReport) {
        let entry = self.downloaded_files.entry(report.file_name.clone()).or_insert(0);
        *entry = (*entry).max(report.bytes_downloaded);

        let sum: u64 = self.downloaded_files.values().sum();
        self.bytes_downloaded = self.bytes_downloaded.max(sum);
        if report.total_bytes.is_some() {
            self.total_bytes = report.total_bytes;
        }
        self.last_updated_at = Utc::now();
    }

    /// Progress percentage (0-100) if the total is known.
    pub fn progress_percent(&self) -> Option<f64> {
        if self.status == DownloadStatus::Completed {
            return Some(100.0);
        }
        self.total_bytes.map(|total| {
            if total == 0 {
                0.0
            } else {
                (self.bytes_downloaded as f64 / total as f64 * 100.0).min(100.0)
            }
        })
    }
}

/// Progress callback payload.
///
/// Sources report per-file byte counts. The orchestrator forwards
/// aggregated reports where `bytes_downloaded` covers the whole model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub file_name: String,
    pub bytes_downloaded: u64,
    /// Size of the whole model, if known
    pub total_bytes: Option<u64>,
    pub bytes_per_second: Option<f64>,
    pub eta: Option<Duration>,
    pub status: DownloadStatus,
}

impl ProgressReport {
    pub fn new(file_name: impl Into<String>, bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes_downloaded,
            total_bytes,
            bytes_per_second: None,
            eta: None,
            status: DownloadStatus::Downloading,
        }
    }
}

/// One file belonging to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelFile {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A concrete downloadable model, as described by a source or read back
/// from local metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub publisher: String,
    pub model_name: String,
    pub artifact_name: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub files: Vec<ModelFile>,
    /// Total size, if every file size is known
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Set once materialized on disk
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Repository-level information from a source's catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoDescriptor {
    pub repo_id: String,
    pub author: Option<String>,
    pub kind: ModelKind,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub files: Vec<ModelFile>,
    #[serde(default)]
    pub gated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DownloadStatus::*;

    const ALL: [DownloadStatus; 6] = [Initializing, Downloading, Paused, Cancelled, Completed, Failed];

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Initializing, Downloading),
            (Initializing, Failed),
            (Initializing, Cancelled),
            (Initializing, Paused),
            (Downloading, Completed),
            (Downloading, Paused),
            (Downloading, Cancelled),
            (Downloading, Failed),
            (Paused, Downloading),
            (Paused, Cancelled),
            (Failed, Initializing),
            (Cancelled, Initializing),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_never_skips_to_completed() {
        assert!(!Initializing.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Initializing));
    }

    #[test]
    fn test_transition_rejected_leaves_record() {
        let mut record = DownloadRecord::new("hf:acme/model-x", ModelKind::TextGeneration, "/tmp/x");
        let before = record.clone();
        assert!(!record.transition(Completed));
        assert_eq!(record, before);
        assert!(record.transition(Downloading));
        assert_eq!(record.status, Downloading);
    }

    #[test]
    fn test_terminal_and_settled() {
        assert!(Completed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Failed.is_terminal());
        assert!(Failed.is_settled());
        assert!(!Paused.is_settled());
        assert!(Initializing.is_active());
        assert!(!Paused.is_active());
    }

    #[test]
    fn test_apply_progress_aggregates_and_never_decreases() {
        let mut record = DownloadRecord::new("hf:acme/model-x", ModelKind::TextGeneration, "/tmp/x");
        record.apply_progress(&ProgressReport::new("a.bin", 400, Some(1000)));
        record.apply_progress(&ProgressReport::new("b.bin", 100, Some(1000)));
        assert_eq!(record.bytes_downloaded, 500);
        assert_eq!(record.total_bytes, Some(1000));

        // A resumed source may re-report an earlier offset
        record.apply_progress(&ProgressReport::new("a.bin", 50, None));
        assert_eq!(record.bytes_downloaded, 500);
        assert_eq!(record.total_bytes, Some(1000));
        assert_eq!(record.progress_percent(), Some(50.0));
    }

    #[test]
    fn test_cancel_reason_outcome() {
        assert_eq!(CancelReason::UserCancel.resulting_status(), Cancelled);
        assert_eq!(CancelReason::UserPause.resulting_status(), Paused);
        assert_eq!(CancelReason::ExternalShutdown.resulting_status(), Paused);
    }

    #[test]
    fn test_model_kind_parse_and_serde() {
        assert_eq!("embedding".parse::<ModelKind>(), Ok(ModelKind::Embedding));
        assert_eq!("Speech_To_Text".parse::<ModelKind>(), Ok(ModelKind::SpeechToText));
        assert!("banana".parse::<ModelKind>().is_err());

        let json = serde_json::to_string(&ModelKind::TextToSpeech).unwrap();
        assert_eq!(json, "\"text-to-speech\"");
    }

    #[test]
    fn test_model_kind_from_pipeline_tag() {
        assert_eq!(ModelKind::from_pipeline_tag(Some("feature-extraction")), ModelKind::Embedding);
        assert_eq!(ModelKind::from_pipeline_tag(Some("text-to-image")), ModelKind::ImageGeneration);
        assert_eq!(ModelKind::from_pipeline_tag(None), ModelKind::Other);
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let mut record = DownloadRecord::new("hf:acme/model-x", ModelKind::Embedding, "/data/models/x");
        record.provider_data.insert("revision".into(), "main".into());
        let json = serde_json::to_string(&record).unwrap();
        let back: DownloadRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
