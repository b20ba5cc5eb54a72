//! User configuration for display device management
//!
//! Loaded from a JSON file in the XDG config directory. Every field has a
//! default, so a partial file only overrides what it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::constants;

/// Device preparation mode chosen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePrepOption {
    /// Do not manage the display at all
    #[default]
    Disabled,
    VerifyOnly,
    EnsureActive,
    EnsurePrimary,
    EnsureOnlyDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOption {
    Disabled,
    /// Use the resolution requested by the client
    #[default]
    Automatic,
    /// Use `manual_resolution`
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRateOption {
    Disabled,
    /// Use the FPS requested by the client
    #[default]
    Automatic,
    /// Use `manual_refresh_rate`
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrOption {
    Disabled,
    #[default]
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayDeviceConfig {
    /// Target output; empty selects the primary display
    #[serde(default)]
    pub output_name: String,
    #[serde(default)]
    pub device_prep: DevicePrepOption,
    #[serde(default)]
    pub resolution: ResolutionOption,
    /// `WIDTHxHEIGHT`, used when `resolution` is manual
    #[serde(default)]
    pub manual_resolution: String,
    #[serde(default)]
    pub refresh_rate: RefreshRateOption,
    /// `N` or `N.F`, used when `refresh_rate` is manual
    #[serde(default)]
    pub manual_refresh_rate: String,
    #[serde(default)]
    pub hdr: HdrOption,
    /// Delay before the first revert attempt after a session ends
    #[serde(default = "default_revert_delay_ms")]
    pub config_revert_delay_ms: u64,
    /// Blank the display briefly around HDR toggles
    #[serde(default)]
    pub hdr_toggle_workaround: bool,
}

fn default_revert_delay_ms() -> u64 {
    3000
}

impl Default for DisplayDeviceConfig {
    fn default() -> Self {
        Self {
            output_name: String::new(),
            device_prep: DevicePrepOption::default(),
            resolution: ResolutionOption::default(),
            manual_resolution: String::new(),
            refresh_rate: RefreshRateOption::default(),
            manual_refresh_rate: String::new(),
            hdr: HdrOption::default(),
            config_revert_delay_ms: default_revert_delay_ms(),
            hdr_toggle_workaround: false,
        }
    }
}

impl DisplayDeviceConfig {
    pub fn path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(constants::config::APP_DIR);
        path.push(constants::config::FILENAME);
        path
    }

    pub fn revert_delay(&self) -> Duration {
        Duration::from_millis(self.config_revert_delay_ms)
    }

    pub fn hdr_blank_delay(&self) -> Option<Duration> {
        self.hdr_toggle_workaround
            .then_some(constants::workarounds::HDR_BLANK_DELAY)
    }

    /// Load configuration from the default location or create the default file
    pub fn load() -> Result<Self> {
        let config_path = Self::path();

        if !config_path.exists() {
            info!(path = %config_path.display(), "Config file not found, creating default config");
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON from {:?}", path))?;

        info!(path = %path.display(), device_prep = ?config.device_prep, "Loaded display config");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;

        fs::write(path, json)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        info!(path = %path.display(), "Saved config");
        Ok(())
    }
}

/// Default location of the persisted pre-change display state
pub fn default_persistence_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(constants::config::APP_DIR);
    path.push(constants::config::PERSISTENCE_FILENAME);
    path
}
