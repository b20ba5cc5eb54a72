//! Display configuration value types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Refresh rate as a fraction, so 59.995 is kept exactly as 59995/1000.
/// Not reduced to lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub numerator: u32,
    pub denominator: u32,
}

impl Rational {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }

    pub fn as_hz(&self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        f64::from(self.numerator) / f64::from(self.denominator)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HdrState {
    Enabled,
    Disabled,
}

/// How aggressively the target device is brought into a usable state
/// before the other attributes are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevicePreparation {
    /// Only check that the device is active
    VerifyOnly,
    /// Activate the device if it is not
    EnsureActive,
    /// Activate and make it the primary display
    EnsurePrimary,
    /// Activate, make primary and deactivate every other display
    EnsureOnlyDisplay,
}

/// One unit of work scheduled against the display hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleDisplayConfiguration {
    /// Target device; empty means the primary display
    pub device_id: String,
    pub device_prep: DevicePreparation,
    pub resolution: Option<Resolution>,
    pub refresh_rate: Option<Rational>,
    pub hdr_state: Option<HdrState>,
}

impl SingleDisplayConfiguration {
    pub fn new(device_id: impl Into<String>, device_prep: DevicePreparation) -> Self {
        Self {
            device_id: device_id.into(),
            device_prep,
            resolution: None,
            refresh_rate: None,
            hdr_state: None,
        }
    }

    /// True when applying this configuration may deactivate other displays
    pub fn may_disable_displays(&self) -> bool {
        self.device_prep == DevicePreparation::EnsureOnlyDisplay
    }
}

/// Outcome of deriving a configuration from user preference and session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedConfiguration {
    /// Display management is not requested; the managed state should be reverted
    Disabled,
    /// Input was invalid; nothing should be applied or reverted
    ParseFailed,
    Configured(SingleDisplayConfiguration),
}

/// Result of a single apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Ok,
    /// The display API is momentarily busy; worth retrying
    ApiTemporarilyUnavailable,
    /// Retrying will not help
    PermanentFailure,
}

/// A display device as reported by the settings manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumeratedDevice {
    pub device_id: String,
    pub display_name: String,
    pub active: bool,
    pub primary: bool,
    pub resolution: Option<Resolution>,
    pub refresh_rate: Option<Rational>,
}
