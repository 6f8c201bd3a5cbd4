// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration stored at `~/.modelpull/config.json`.
//!
//! Precedence, lowest to highest: defaults, the config file, environment
//! variables (`MODELPULL_HUB_TOKEN` or `HF_TOKEN`, `MODELPULL_BASE_DIR`),
//! then command line flags applied by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hub::DEFAULT_ENDPOINT;
use crate::utils::mask_sensitive;

pub const ENV_HUB_TOKEN: &str = "MODELPULL_HUB_TOKEN";
pub const ENV_HF_TOKEN: &str = "HF_TOKEN";
pub const ENV_BASE_DIR: &str = "MODELPULL_BASE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Where state files and models live (default: `~/.modelpull`)
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Concurrent transfers (default: 2)
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// Upper bound for `pull` to wait, unset means no limit
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
    #[serde(default = "default_hub_endpoint")]
    pub hub_endpoint: String,
    #[serde(default)]
    pub hub_token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_concurrent_downloads() -> usize {
    2
}

fn default_hub_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_user_agent() -> String {
    format!("modelpull/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            wait_timeout_secs: None,
            hub_endpoint: default_hub_endpoint(),
            hub_token: None,
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty(ENV_HUB_TOKEN).or_else(|| non_empty(ENV_HF_TOKEN)) {
            self.hub_token = Some(token);
        }
        if let Some(dir) = non_empty(ENV_BASE_DIR) {
            self.base_dir = Some(PathBuf::from(dir));
        }
    }

    /// Effective base directory.
    pub fn base_dir(&self) -> Result<PathBuf> {
        match &self.base_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_config_dir(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Copy safe for printing.
    pub fn masked(&self) -> Self {
        Self {
            hub_token: self.hub_token.as_deref().map(|t| mask_sensitive(t, 5)),
            ..self.clone()
        }
    }
}

/// `~/.modelpull`
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".modelpull"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

/// Load the config file (defaults if missing) and apply the environment.
pub fn load_config() -> Result<Config> {
    let mut config = load_config_from(&config_path()?)?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse config: {:?}", path))
}

/// Save to `~/.modelpull/config.json`. Environment overrides are not
/// written back, so callers should save a config loaded with
/// [`load_config_from`].
pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))?;
    Ok(())
}
