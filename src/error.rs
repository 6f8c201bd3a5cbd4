// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for download orchestration.
//!
//! Every public operation of the orchestrator and the facade returns
//! [`DownloadError`]. The type is `Clone` so one outcome can be handed to
//! every caller that joined a deduplicated download.

use std::time::Duration;

use thiserror::Error;

use crate::download::types::DownloadStatus;
use crate::utils::format_bytes;

/// Hint appended to authentication failures.
pub const AUTH_HINT: &str = "requires authentication; provide an access token with \
     `modelpull config set-token <token>` or the MODELPULL_HUB_TOKEN environment variable";

const RATE_LIMIT_HINT: &str = "rate limited by the source, retry later";

/// Classification of a transfer failure that the user can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The source rejected our credentials (or we sent none).
    Authentication,
    /// The source asked us to slow down.
    RateLimited,
}

impl FailureKind {
    /// Classify a raw error message coming back from a source.
    pub fn classify(message: &str) -> Option<Self> {
        let lower = message.to_lowercase();
        let has_code = |code: &str| {
            lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == code)
        };

        if lower.contains("requires authentication")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("gated")
            || has_code("401")
            || has_code("403")
        {
            Some(FailureKind::Authentication)
        } else if lower.contains("rate limit") || lower.contains("too many requests") || has_code("429") {
            Some(FailureKind::RateLimited)
        } else {
            None
        }
    }
}

/// Errors surfaced by the orchestrator, the facade and source downloaders.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// No source downloader can handle the identifier, or the source does not know it.
    #[error("model '{model_id}' not found: no source can provide it")]
    NotFound { model_id: String },

    /// Pre-flight disk check failed.
    #[error("insufficient disk space: need {}, only {} available", bytes(.required), bytes(.available))]
    InsufficientSpace { required: u64, available: u64 },

    /// Waiting for completion took longer than the configured limit.
    #[error("timed out after {waited:?} waiting for '{model_id}' to finish")]
    Timeout { model_id: String, waited: Duration },

    /// The source reported an error while transferring.
    #[error("download of '{model_id}' failed: {message}")]
    TransferFailed {
        model_id: String,
        message: String,
        kind: Option<FailureKind>,
    },

    /// The download was cancelled before it finished.
    #[error("download of '{model_id}' was cancelled")]
    Cancelled { model_id: String },

    /// The download stopped without finishing (process shutdown) and can be resumed.
    #[error("download of '{model_id}' was interrupted while {status}; it can be resumed")]
    Interrupted { model_id: String, status: DownloadStatus },

    /// The requested operation is not valid from the record's current status.
    #[error("cannot {action} '{model_id}' while it is {from}")]
    InvalidTransition {
        model_id: String,
        from: DownloadStatus,
        action: &'static str,
    },

    /// No record exists for the identifier.
    #[error("no download is tracked for '{model_id}'")]
    NotTracked { model_id: String },

    /// The source did not acknowledge a pause or cancel request.
    #[error("source refused to {action} '{model_id}'")]
    SourceRefused { model_id: String, action: &'static str },

    /// The manager has been shut down and accepts no new work.
    #[error("download manager is shutting down; '{model_id}' was not scheduled")]
    ShuttingDown { model_id: String },

    #[error("invalid model id '{input}': expected registry:publisher/model[/artifact]")]
    InvalidModelId { input: String },

    #[error("state persistence failed: {message}")]
    Persistence { message: String },

    #[error("i/o error: {message}")]
    Io { message: String },
}

fn bytes(value: &u64) -> String {
    format_bytes(*value)
}

impl DownloadError {
    /// Build a `TransferFailed`, relabelling authentication-shaped errors with
    /// an actionable message.
    pub fn transfer(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let message = message.into();
        let kind = FailureKind::classify(&message);

        let message = match kind {
            Some(FailureKind::Authentication) if !message.contains(AUTH_HINT) => {
                format!("'{}' {} ({})", model_id, AUTH_HINT, message)
            }
            Some(FailureKind::RateLimited) if !message.contains(RATE_LIMIT_HINT) => {
                format!("{} ({})", RATE_LIMIT_HINT, message)
            }
            _ => message,
        };

        DownloadError::TransferFailed {
            model_id,
            message,
            kind,
        }
    }

    /// Authentication failure for a model, already carrying the hint.
    pub fn authentication_required(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        DownloadError::TransferFailed {
            message: format!("'{}' {}", model_id, AUTH_HINT),
            model_id,
            kind: Some(FailureKind::Authentication),
        }
    }

    pub fn not_found(model_id: impl Into<String>) -> Self {
        DownloadError::NotFound {
            model_id: model_id.into(),
        }
    }

    pub fn cancelled(model_id: impl Into<String>) -> Self {
        DownloadError::Cancelled {
            model_id: model_id.into(),
        }
    }

    pub fn io(err: impl std::fmt::Display) -> Self {
        DownloadError::Io {
            message: err.to_string(),
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        DownloadError::Persistence {
            message: format!("{:#}", err),
        }
    }

    /// The message without the "download of ... failed" framing, for
    /// storing on a record.
    pub fn detail(&self) -> String {
        match self {
            DownloadError::TransferFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True when the error represents a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled { .. })
    }

    /// Failure classification, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DownloadError::TransferFailed { kind, .. } => *kind,
            _ => None,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_authentication() {
        assert_eq!(FailureKind::classify("HTTP 401 Unauthorized"), Some(FailureKind::Authentication));
        assert_eq!(FailureKind::classify("status 403"), Some(FailureKind::Authentication));
        assert_eq!(
            FailureKind::classify("Access to model acme/x is restricted, it is gated"),
            Some(FailureKind::Authentication)
        );
    }

    #[test]
    fn test_classify_ignores_embedded_digits() {
        assert_eq!(FailureKind::classify("read 4013 bytes then connection reset"), None);
        assert_eq!(FailureKind::classify("wrote 14290 bytes"), None);
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(FailureKind::classify("HTTP 429 Too Many Requests"), Some(FailureKind::RateLimited));
        assert_eq!(FailureKind::classify("rate limit exceeded"), Some(FailureKind::RateLimited));
    }

    #[test]
    fn test_transfer_relabels_authentication() {
        let err = DownloadError::transfer("hf:acme/private", "HTTP 401 Unauthorized");
        assert_eq!(err.failure_kind(), Some(FailureKind::Authentication));
        let text = err.to_string();
        assert!(text.contains("requires authentication"), "{}", text);
        assert!(text.contains("set-token"), "{}", text);
    }

    #[test]
    fn test_transfer_does_not_double_wrap() {
        let first = DownloadError::authentication_required("hf:acme/private");
        let message = match &first {
            DownloadError::TransferFailed { message, .. } => message.clone(),
            _ => unreachable!(),
        };
        let second = DownloadError::transfer("hf:acme/private", message.clone());
        match second {
            DownloadError::TransferFailed { message: again, .. } => assert_eq!(again, message),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_wrapped_once() {
        let first = DownloadError::transfer("hf:acme/x", "HTTP 429 Too Many Requests");
        let again = DownloadError::transfer("hf:acme/x", first.detail());
        assert_eq!(again.detail(), first.detail());
        assert_eq!(again.failure_kind(), Some(FailureKind::RateLimited));
    }

    #[test]
    fn test_plain_failure_keeps_message() {
        let err = DownloadError::transfer("hf:acme/x", "connection reset by peer");
        assert_eq!(err.failure_kind(), None);
        assert!(err.to_string().ends_with("connection reset by peer"));
    }

    #[test]
    fn test_insufficient_space_display() {
        let err = DownloadError::InsufficientSpace {
            required: 2 * 1_073_741_824,
            available: 1_048_576,
        };
        assert_eq!(err.to_string(), "insufficient disk space: need 2.0 GB, only 1.0 MB available");
    }
}
