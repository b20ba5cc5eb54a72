//! Application-wide constants
//!
//! Timing values, file locations and protocol limits shared across modules.

use std::time::Duration;

/// Retry loop timing
pub mod retry {
    use super::Duration;

    /// Fixed interval between attempts of an apply or revert loop
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);
}

/// Audio session handling
pub mod audio {
    use super::Duration;

    /// Time given to the audio device to reappear before the session reference is dropped
    pub const RELEASE_SETTLE_DELAY: Duration = Duration::from_millis(500);
}

/// Display backend workarounds
pub mod workarounds {
    use super::Duration;

    /// Blank period inserted around HDR toggles when the workaround is enabled
    pub const HDR_BLANK_DELAY: Duration = Duration::from_millis(500);
}

/// RandR tuning
pub mod randr {
    /// Minimum RandR version providing output primary and current-resources requests
    pub const MIN_MAJOR_VERSION: u32 = 1;
    pub const MIN_MINOR_VERSION: u32 = 3;

    /// Largest refresh rate difference (Hz) accepted when picking a mode
    pub const REFRESH_TOLERANCE_HZ: f64 = 0.5;

    /// Nominal DPI used to derive physical screen size after a resize
    pub const NOMINAL_DPI: f64 = 96.0;

    pub const MM_PER_INCH: f64 = 25.4;
}

/// Configuration and state file locations
pub mod config {
    /// Application directory under the XDG config/data directories
    pub const APP_DIR: &str = "display-session";

    /// User configuration filename
    pub const FILENAME: &str = "config.json";

    /// Persisted pre-change display state filename
    pub const PERSISTENCE_FILENAME: &str = "display_settings.json";
}

/// IPC socket
pub mod ipc {
    /// Socket path relative to the runtime (or cache) directory
    pub const SOCKET_NAME: &str = "display-session/daemon.sock";

    /// Maximum message size (10 MB) to prevent memory exhaustion
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
}
