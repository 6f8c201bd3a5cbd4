// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for modelpull.
//!
//! Small helpers shared by the state store, the CLI and the hub source.

use std::time::Duration;

/// Turn a model identifier into something usable as a file name.
///
/// `:` and `/` (and `\` for good measure on Windows) become `_`.
///
/// # Examples
///
/// ```
/// use modelpull::utils::sanitize_model_id;
///
/// assert_eq!(sanitize_model_id("hf:acme/model-x"), "hf_acme_model-x");
/// ```
pub fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Mask a sensitive string (like access tokens) for display.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// ```
/// use modelpull::utils::mask_sensitive;
///
/// assert_eq!(mask_sensitive("hf_abcdefghijklmnop", 5), "hf_ab...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        // Still mask short values so their length is not obvious
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Human readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Human readable transfer rate.
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

/// Short ETA string such as `1h 5m`, `3m 20s` or `42s`.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_model_id() {
        assert_eq!(sanitize_model_id("hf:acme/model-x"), "hf_acme_model-x");
        assert_eq!(
            sanitize_model_id("hf:acme/model-x/model-x-Q4_K_M"),
            "hf_acme_model-x_model-x-Q4_K_M"
        );
        assert_eq!(sanitize_model_id("plain"), "plain");
    }

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("hf_secret_token_value", 3), "hf_...");
        assert_eq!(mask_sensitive("short", 8), "...");
        assert_eq!(mask_sensitive("", 8), "...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1_048_576), "5.0 MB");
        assert_eq!(format_bytes(3 * 1_073_741_824), "3.0 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(200)), "3m 20s");
        assert_eq!(format_eta(Duration::from_secs(3900)), "1h 5m");
    }
}
