//! IPC message types for CLI ↔ daemon communication

use serde::{Deserialize, Serialize};

use crate::config::SessionParams;
use crate::display::{EnumeratedDevice, SingleDisplayConfiguration};

/// Requests sent from the CLI to the daemon
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum DaemonRequest {
    /// Derive the configuration from the loaded user config and this session, then apply it
    Configure(SessionParams),

    /// Apply a configuration as-is
    ConfigureExplicit(SingleDisplayConfiguration),

    /// Restore the display state saved before the first change
    Revert,

    /// Cancel pending work and forget the saved display state
    ResetPersistence,

    ResolveDisplayName(String),

    ListDevices,

    /// Re-read the config file and re-initialize display management
    Reload,

    /// Health check
    Ping,

    /// Request graceful shutdown
    Shutdown,
}

/// Responses sent from the daemon to the CLI
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum DaemonResponse {
    /// Acknowledgment that request was processed
    Ready,

    /// Health check response
    Pong,

    DisplayName(String),

    Devices(Vec<EnumeratedDevice>),

    /// Result of `ResetPersistence`
    PersistenceReset(bool),

    /// Error occurred
    Error(String),
}
