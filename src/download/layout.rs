// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout for completed models.
//!
//! `{base}/models/{kind}/{publisher}/{model}/{artifact}.{ext}` with a sibling
//! `{artifact}.json` describing what was downloaded. The metadata file is
//! written last, so its presence means the model is complete.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use super::model_id::ModelRef;
use super::types::{ModelDescriptor, ModelKind};
use crate::error::DownloadError;

#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    /// Layout rooted at `{base_dir}/models`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            root: base_dir.as_ref().join("models"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that receives the artifact files.
    pub fn model_dir(&self, kind: ModelKind, model: &ModelRef) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(&model.publisher)
            .join(&model.model)
    }

    pub fn metadata_path(&self, kind: ModelKind, model: &ModelRef) -> PathBuf {
        self.model_dir(kind, model)
            .join(format!("{}.json", model.artifact_name()))
    }

    /// Look for a completed model under any kind.
    pub fn find_local(&self, model: &ModelRef) -> Option<ModelDescriptor> {
        ModelKind::ALL.iter().find_map(|kind| {
            let path = self.metadata_path(*kind, model);
            if !path.exists() {
                return None;
            }
            match read_metadata(&path) {
                Ok(descriptor) => {
                    let present = descriptor
                        .local_path
                        .as_ref()
                        .map(|p| p.exists())
                        .unwrap_or(false);
                    present.then_some(descriptor)
                }
                Err(e) => {
                    tracing::warn!("METADATA_UNREADABLE | path={:?} error={:#}", path, e);
                    None
                }
            }
        })
    }

    /// Stamp a freshly downloaded model with its local path and write its
    /// metadata file.
    pub fn materialize(
        &self,
        model: &ModelRef,
        mut descriptor: ModelDescriptor,
        target_dir: &Path,
    ) -> Result<ModelDescriptor> {
        descriptor.local_path = Some(match descriptor.files.as_slice() {
            [single] => target_dir.join(&single.name),
            _ => target_dir.to_path_buf(),
        });
        descriptor.downloaded_at = Some(Utc::now());

        let path = self.metadata_path(descriptor.kind, model);
        write_metadata(&path, &descriptor)?;
        tracing::info!(
            "MODEL_MATERIALIZED | model_id={} path={:?}",
            descriptor.model_id,
            descriptor.local_path
        );
        Ok(descriptor)
    }
}

fn read_metadata(path: &Path) -> Result<ModelDescriptor> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read metadata: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse metadata: {:?}", path))
}

fn write_metadata(path: &Path, descriptor: &ModelDescriptor) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create model directory: {:?}", parent))?;
    }
    let content =
        serde_json::to_string_pretty(descriptor).context("Failed to serialize model metadata")?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write metadata: {:?}", temp_path))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to move metadata into place: {:?}", path))?;
    Ok(())
}

/// Fail with `InsufficientSpace` if the filesystem holding `dir` has less
/// than `required` bytes free. `dir` does not need to exist yet.
pub fn ensure_space(dir: &Path, required: u64) -> Result<(), DownloadError> {
    let probe = dir
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));

    let available = fs2::available_space(probe).map_err(DownloadError::io)?;
    if available < required {
        tracing::warn!(
            "INSUFFICIENT_SPACE | dir={:?} required={} available={}",
            dir,
            required,
            available
        );
        return Err(DownloadError::InsufficientSpace { required, available });
    }
    Ok(())
}
