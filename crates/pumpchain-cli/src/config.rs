//! Settings file handling for pumpchain

use anyhow::{Context, Result};
use pumpchain_core::protocol::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Values read from `settings.json`; anything missing falls back to the connection defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port_name: Option<String>,
    pub baud_rate: Option<u32>,
    pub read_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub chain_length: Option<u8>,
    pub keep_open: Option<bool>,
}

impl Settings {
    /// Load settings from the default location, or defaults when the file does not exist
    pub fn load() -> Result<Self> {
        let path = Self::settings_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }

    pub fn settings_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pumpchain");
        Ok(dir.join("settings.json"))
    }

    /// Merge command-line flags over file values
    pub fn merge_with_args(&self, port: Option<&str>, baud: Option<u32>) -> ConnectionConfig {
        let defaults = ConnectionConfig::default();
        ConnectionConfig {
            port_name: port
                .map(String::from)
                .or_else(|| self.port_name.clone())
                .unwrap_or(defaults.port_name),
            baud_rate: baud.or(self.baud_rate).unwrap_or(defaults.baud_rate),
            read_timeout_ms: self.read_timeout_ms.unwrap_or(defaults.read_timeout_ms),
            response_timeout_ms: self
                .response_timeout_ms
                .unwrap_or(defaults.response_timeout_ms),
            chain_length: self.chain_length.unwrap_or(defaults.chain_length),
            keep_open: self.keep_open.unwrap_or(defaults.keep_open),
        }
    }
}
