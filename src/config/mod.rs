//! Configuration inputs for display management
//!
//! - **settings**: user preference loaded from the JSON config file
//! - **session**: per-session parameters supplied by the streaming client

pub mod session;
pub mod settings;

// Re-export commonly used types
pub use session::SessionParams;
pub use settings::{
    default_persistence_path, DevicePrepOption, DisplayDeviceConfig, HdrOption,
    RefreshRateOption, ResolutionOption,
};
