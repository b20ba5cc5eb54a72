//! Parameters of the streaming session requesting a display configuration

use serde::{Deserialize, Serialize};

/// Per-session display request. Negative dimensions or FPS mean the
/// client did not provide a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Client enabled "optimize game settings"
    pub enable_sops: bool,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    pub enable_hdr: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            enable_sops: false,
            width: -1,
            height: -1,
            fps: -1,
            enable_hdr: false,
        }
    }
}
