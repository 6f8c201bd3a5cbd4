// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent state management for downloads.
//!
//! One file per model under `{base}/.downloads/`, so downloads can be
//! resumed after a restart. Files are written to a temp file, synced and
//! renamed over the target, and carry a SHA-256 of the record so a torn or
//! hand-edited file is detected on load instead of half-parsed.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{DownloadRecord, DownloadStatus};
use crate::utils::sanitize_model_id;

/// Extension of every state file.
pub const STATE_EXTENSION: &str = "download.json";

const STATE_VERSION: u32 = 1;

/// On-disk envelope around a record.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    /// Hex SHA-256 of the canonical JSON of `record`
    checksum: String,
    record: serde_json::Value,
}

/// File-per-model persistence of [`DownloadRecord`]s.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `{base_dir}/.downloads`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: base_dir.as_ref().join(".downloads"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `model_id`.
    pub fn state_path(&self, model_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_model_id(model_id), STATE_EXTENSION))
    }

    /// Save a record atomically (temp file + sync + rename).
    pub fn save(&self, record: &DownloadRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory: {:?}", self.dir))?;

        let value = serde_json::to_value(record).context("Failed to serialize download record")?;
        let envelope = StateFile {
            version: STATE_VERSION,
            checksum: checksum(&value)?,
            record: value,
        };
        let content =
            serde_json::to_string_pretty(&envelope).context("Failed to serialize state file")?;

        let path = self.state_path(&record.model_id);
        let temp_path = path.with_extension("tmp");

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write to temp file")?;

            // Flush to disk before the rename makes it visible
            temp_file.sync_all().context("Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path).with_context(|| {
            format!("Failed to rename temp file to state file: {:?} -> {:?}", temp_path, path)
        })?;

        tracing::debug!(
            "STATE_SAVED | model_id={} status={} bytes={}",
            record.model_id,
            record.status,
            record.bytes_downloaded
        );
        Ok(())
    }

    /// Load the record for `model_id`, if one was persisted.
    ///
    /// The returned record is always `Paused`: whatever is on disk is
    /// assumed to be an interrupted transfer. A corrupt file is an error.
    pub fn load(&self, model_id: &str) -> Result<Option<DownloadRecord>> {
        let path = self.state_path(model_id);
        if !path.exists() {
            return Ok(None);
        }
        read_state_file(&path).map(Some)
    }

    /// Remove the state file for `model_id`. Failures are logged, not raised.
    pub fn delete(&self, model_id: &str) {
        let path = self.state_path(model_id);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("STATE_DELETED | model_id={}", model_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "STATE_DELETE_FAILED | model_id={} path={:?} error={}",
                model_id,
                path,
                e
            ),
        }
    }

    /// Load every persisted record, keyed by model id.
    ///
    /// Corrupt files are renamed to `*.corrupt` and skipped so one bad file
    /// cannot hide the others.
    pub fn load_all(&self) -> Result<HashMap<String, DownloadRecord>> {
        let mut records = HashMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state directory: {:?}", self.dir))
            }
        };

        for entry in entries {
            let path = entry.context("Failed to read state directory entry")?.path();
            let is_state_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&format!(".{}", STATE_EXTENSION)))
                .unwrap_or(false);
            if !is_state_file {
                continue;
            }

            match read_state_file(&path) {
                Ok(record) => {
                    records.insert(record.model_id.clone(), record);
                }
                Err(e) => {
                    tracing::warn!("STATE_CORRUPT | path={:?} error={:#}", path, e);
                    quarantine(&path);
                }
            }
        }

        tracing::info!("STATE_LOADED | dir={:?} records={}", self.dir, records.len());
        Ok(records)
    }
}

fn checksum(value: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_vec(value).context("Failed to serialize record for checksum")?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn read_state_file(path: &Path) -> Result<DownloadRecord> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read state file: {:?}", path))?;
    let envelope: StateFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {:?}", path))?;

    if envelope.version > STATE_VERSION {
        bail!("Unsupported state file version {} in {:?}", envelope.version, path);
    }
    if checksum(&envelope.record)? != envelope.checksum {
        bail!("Checksum mismatch in state file: {:?}", path);
    }

    let mut record: DownloadRecord = serde_json::from_value(envelope.record)
        .with_context(|| format!("Failed to decode download record in {:?}", path))?;

    // Nothing on disk is ever assumed complete
    record.status = DownloadStatus::Paused;
    Ok(record)
}

fn quarantine(path: &Path) {
    let target = path.with_extension("corrupt");
    if let Err(e) = fs::rename(path, &target) {
        tracing::warn!("STATE_QUARANTINE_FAILED | path={:?} error={}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::{ModelKind, ProgressReport};
    use tempfile::TempDir;

    fn record(id: &str, status: DownloadStatus) -> DownloadRecord {
        let mut r = DownloadRecord::new(id, ModelKind::TextGeneration, "/data/models/x");
        r.apply_progress(&ProgressReport::new("model.gguf", 750, Some(1000)));
        r.provider_data.insert("revision".into(), "main".into());
        r.set_status(status);
        r
    }

    #[test]
    fn test_state_path_is_sanitized() {
        let store = StateStore::new("/base");
        assert_eq!(
            store.state_path("hf:acme/model-x"),
            PathBuf::from("/base/.downloads/hf_acme_model-x.download.json")
        );
    }

    #[test]
    fn test_save_and_load_forces_paused() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());

        let saved = record("hf:acme/model-x", DownloadStatus::Downloading);
        store.save(&saved).unwrap();

        let loaded = store.load("hf:acme/model-x").unwrap().expect("record should exist");
        assert_eq!(loaded.status, DownloadStatus::Paused);
        assert_eq!(loaded.bytes_downloaded, 750);
        assert_eq!(loaded.total_bytes, Some(1000));
        assert_eq!(loaded.provider_data.get("revision").map(String::as_str), Some("main"));
        assert_eq!(loaded.started_at, saved.started_at);
    }

    #[test]
    fn test_recovery_is_paused_for_every_non_terminal_status() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());

        let statuses = [
            DownloadStatus::Initializing,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Failed,
        ];
        for (i, status) in statuses.iter().enumerate() {
            store.save(&record(&format!("hf:acme/m{}", i), *status)).unwrap();
        }

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), statuses.len());
        assert!(all.values().all(|r| r.status == DownloadStatus::Paused));
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        assert!(store.load("hf:acme/nothing").unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_best_effort() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        store.save(&record("hf:acme/model-x", DownloadStatus::Paused)).unwrap();

        store.delete("hf:acme/model-x");
        assert!(!store.state_path("hf:acme/model-x").exists());
        // Deleting again must not panic or error
        store.delete("hf:acme/model-x");
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        store.save(&record("hf:acme/model-x", DownloadStatus::Downloading)).unwrap();
        store.save(&record("hf:acme/model-x", DownloadStatus::Paused)).unwrap();

        let names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["hf_acme_model-x.download.json".to_string()]);
    }

    #[test]
    fn test_truncated_file_is_detected_and_quarantined() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        store.save(&record("hf:acme/good", DownloadStatus::Paused)).unwrap();
        store.save(&record("hf:acme/torn", DownloadStatus::Paused)).unwrap();

        let torn = store.state_path("hf:acme/torn");
        let content = fs::read_to_string(&torn).unwrap();
        fs::write(&torn, &content[..content.len() / 2]).unwrap();

        assert!(store.load("hf:acme/torn").is_err());

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("hf:acme/good"));
        assert!(!torn.exists());
        assert!(torn.with_extension("corrupt").exists());
    }

    #[test]
    fn test_tampered_record_fails_checksum() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        store.save(&record("hf:acme/model-x", DownloadStatus::Paused)).unwrap();

        let path = store.state_path("hf:acme/model-x");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("750", "999")).unwrap();

        let err = store.load("hf:acme/model-x").unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"), "{}", err);
    }
}
