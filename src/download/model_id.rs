// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parsing of `registry:publisher/model[/artifact]` identifiers.

use std::fmt;
use std::str::FromStr;

use crate::error::DownloadError;

/// A parsed model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub registry: String,
    pub publisher: String,
    pub model: String,
    /// A specific packaging of the model, e.g. one quantization
    pub artifact: Option<String>,
}

impl ModelRef {
    pub fn parse(input: &str) -> Result<Self, DownloadError> {
        let invalid = || DownloadError::InvalidModelId {
            input: input.to_string(),
        };

        let (registry, path) = input.trim().split_once(':').ok_or_else(invalid)?;
        if registry.is_empty() || !registry.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid());
        }

        let parts: Vec<&str> = path.split('/').collect();
        if !(2..=3).contains(&parts.len()) || !parts.iter().all(|p| is_valid_segment(p)) {
            return Err(invalid());
        }

        Ok(Self {
            registry: registry.to_lowercase(),
            publisher: parts[0].to_string(),
            model: parts[1].to_string(),
            artifact: parts.get(2).map(|s| s.to_string()),
        })
    }

    /// `publisher/model`, the repository part of the id.
    pub fn repo_id(&self) -> String {
        format!("{}/{}", self.publisher, self.model)
    }

    /// Artifact name, defaulting to the model name.
    pub fn artifact_name(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.model)
    }
}

// Segments end up as directory names, so keep them boring.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FromStr for ModelRef {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelRef::parse(s)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.registry, self.publisher, self.model)?;
        if let Some(artifact) = &self.artifact {
            write!(f, "/{}", artifact)?;
        }
        Ok(())
    }
}
