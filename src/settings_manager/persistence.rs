//! File-backed store for the pre-change display state
//!
//! Survives process restarts so a crashed session can still be reverted.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SettingsPersistence {
    path: PathBuf,
}

impl SettingsPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been persisted
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read persisted state from {:?}", self.path)
                });
            }
        };

        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse persisted state from {:?}", self.path))?;
        Ok(Some(value))
    }

    pub fn store<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(value)
            .context("Failed to serialize persisted state to JSON")?;

        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write persisted state to {:?}", self.path))?;

        info!(path = %self.path.display(), "Saved persisted display state");
        Ok(())
    }

    /// Remove the persisted state; a missing file is not an error
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared persisted display state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted display state to clear");
                Ok(())
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove persisted state {:?}", self.path)),
        }
    }
}
