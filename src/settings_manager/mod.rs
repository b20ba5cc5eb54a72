//! Display settings capability
//!
//! [`SettingsManager`] is the seam between orchestration and the platform's
//! display API. Whether the platform is supported is decided once, at
//! construction, by [`make_settings_manager`].

pub mod persistence;
pub mod x11;

use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DisplayDeviceConfig;
use crate::display::{ApplyResult, EnumeratedDevice, SingleDisplayConfiguration};

pub use persistence::SettingsPersistence;
pub use x11::X11SettingsManager;

/// Operations a platform backend exposes. All of them are safe to repeat.
pub trait SettingsManager: Send {
    fn enumerate_available_devices(&mut self) -> Vec<EnumeratedDevice>;

    /// Canonical display name for a device id; empty when no such device exists
    fn resolve_display_name(&mut self, device_id: &str) -> String;

    fn apply(&mut self, config: &SingleDisplayConfiguration) -> ApplyResult;

    /// Restore the state saved before the first apply.
    /// `true` when fully reverted or when there was nothing to revert.
    fn revert(&mut self) -> bool;

    /// Forget the saved pre-change state without restoring it
    fn reset_persistence(&mut self) -> bool;
}

/// Platform quirks toggled from user configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Workarounds {
    pub hdr_blank_delay: Option<Duration>,
}

impl Workarounds {
    pub fn from_config(config: &DisplayDeviceConfig) -> Self {
        Self {
            hdr_blank_delay: config.hdr_blank_delay(),
        }
    }
}

/// Build the settings manager for this system, or `None` when display
/// management is not supported here
pub fn make_settings_manager(
    persistence_path: &Path,
    config: &DisplayDeviceConfig,
) -> Option<Box<dyn SettingsManager>> {
    let persistence = SettingsPersistence::new(persistence_path);
    match X11SettingsManager::connect(persistence, Workarounds::from_config(config)) {
        Ok(manager) => {
            info!(persistence = %persistence_path.display(), "Display management available through RandR");
            Some(Box::new(manager))
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Display management is not supported on this system");
            None
        }
    }
}
