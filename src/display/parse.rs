//! Derivation of the target display configuration
//!
//! Pure functions turning the user's display settings and the session
//! parameters into a [`ParsedConfiguration`]. Rejected input is logged where
//! it is detected; callers only see the coarse outcome.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{error, warn};

use super::types::{
    DevicePreparation, HdrState, ParsedConfiguration, Rational, Resolution,
    SingleDisplayConfiguration,
};
use crate::config::{
    DevicePrepOption, DisplayDeviceConfig, HdrOption, RefreshRateOption, ResolutionOption,
    SessionParams,
};

static RESOLUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)x([0-9]+)$").expect("resolution pattern is valid"));

static REFRESH_RATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)(?:\.([0-9]+))?$").expect("refresh rate pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("resolution {0:?} must match a \"1920x1080\" pattern")]
    MalformedResolution(String),
    #[error("refresh rate {0:?} must match a \"123\" or \"123.456\" pattern")]
    MalformedRefreshRate(String),
    #[error("{0:?} is out of range")]
    OutOfRange(String),
    #[error("session resolution {width}x{height} is invalid")]
    InvalidSessionResolution { width: i32, height: i32 },
    #[error("session FPS {0} is invalid")]
    InvalidSessionFps(i32),
    #[error("manual resolution must be specified")]
    MissingManualResolution,
    #[error("manual refresh rate must be specified")]
    MissingManualRefreshRate,
}

fn parse_u32(digits: &str) -> Result<u32, ParseError> {
    // Input is pre-validated as ASCII digits, so the only failure is overflow
    digits
        .parse::<u32>()
        .map_err(|_| ParseError::OutOfRange(digits.to_string()))
}

/// Parse a `WIDTHxHEIGHT` string. An empty (or blank) string means "unset".
pub fn parse_resolution(input: &str) -> Result<Option<Resolution>, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let Some(captures) = RESOLUTION_PATTERN.captures(trimmed) else {
        error!(input = %trimmed, "Failed to parse resolution string, it must match a \"1920x1080\" pattern");
        return Err(ParseError::MalformedResolution(trimmed.to_string()));
    };

    let width = parse_u32(&captures[1]);
    let height = parse_u32(&captures[2]);
    match (width, height) {
        (Ok(width), Ok(height)) => Ok(Some(Resolution::new(width, height))),
        (Err(e), _) | (_, Err(e)) => {
            error!(input = %trimmed, "Failed to parse resolution string (number out of range)");
            Err(e)
        }
    }
}

/// Parse an `N` or `N.F` refresh rate. An empty (or blank) string means "unset".
///
/// Leading zeros of the integer part and trailing zeros of the fractional part
/// are dropped before the decimal point is folded into the denominator:
/// `59.995` becomes `59995/1000`, `00059.9500` becomes `5995/100`.
pub fn parse_refresh_rate(input: &str) -> Result<Option<Rational>, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let Some(captures) = REFRESH_RATE_PATTERN.captures(trimmed) else {
        error!(input = %trimmed, "Failed to parse refresh rate string, it must match a \"123\" or \"123.456\" pattern");
        return Err(ParseError::MalformedRefreshRate(trimmed.to_string()));
    };

    let mut integer = captures[1].trim_start_matches('0');
    if integer.is_empty() {
        integer = "0";
    }
    let fraction = captures
        .get(2)
        .map(|m| m.as_str().trim_end_matches('0'))
        .unwrap_or("");

    let rational = if fraction.is_empty() {
        parse_u32(integer).map(|numerator| Rational::new(numerator, 1))
    } else {
        let numerator = parse_u32(&format!("{integer}{fraction}"));
        let denominator = u32::try_from(fraction.len())
            .ok()
            .and_then(|places| 10u32.checked_pow(places))
            .ok_or_else(|| ParseError::OutOfRange(trimmed.to_string()));
        numerator.and_then(|numerator| denominator.map(|d| Rational::new(numerator, d)))
    };

    rational.map(Some).inspect_err(|_| {
        error!(input = %trimmed, "Failed to parse refresh rate string (number out of range)");
    })
}

/// Map the user's device preparation option; `None` disables management entirely
pub fn derive_device_preparation(option: DevicePrepOption) -> Option<DevicePreparation> {
    match option {
        DevicePrepOption::VerifyOnly => Some(DevicePreparation::VerifyOnly),
        DevicePrepOption::EnsureActive => Some(DevicePreparation::EnsureActive),
        DevicePrepOption::EnsurePrimary => Some(DevicePreparation::EnsurePrimary),
        DevicePrepOption::EnsureOnlyDisplay => Some(DevicePreparation::EnsureOnlyDisplay),
        DevicePrepOption::Disabled => None,
    }
}

/// Resolution changes require the client's "optimize game settings" flag in
/// both automatic and manual mode; without it the resolution is left alone.
pub fn derive_resolution(
    config: &DisplayDeviceConfig,
    session: &SessionParams,
) -> Result<Option<Resolution>, ParseError> {
    match config.resolution {
        ResolutionOption::Automatic => {
            if !session.enable_sops {
                warn!("Resolution is configured to change automatically, but \"Optimize game settings\" is not set in the client. Resolution will not be changed.");
                return Ok(None);
            }

            match (u32::try_from(session.width), u32::try_from(session.height)) {
                (Ok(width), Ok(height)) => Ok(Some(Resolution::new(width, height))),
                _ => {
                    error!(width = session.width, height = session.height, "Resolution provided by client session is invalid");
                    Err(ParseError::InvalidSessionResolution {
                        width: session.width,
                        height: session.height,
                    })
                }
            }
        }
        ResolutionOption::Manual => {
            if !session.enable_sops {
                warn!("Resolution is configured to change manually, but \"Optimize game settings\" is not set in the client. Resolution will not be changed.");
                return Ok(None);
            }

            match parse_resolution(&config.manual_resolution)? {
                Some(resolution) => Ok(Some(resolution)),
                None => {
                    error!("Manual resolution must be specified");
                    Err(ParseError::MissingManualResolution)
                }
            }
        }
        ResolutionOption::Disabled => Ok(None),
    }
}

pub fn derive_refresh_rate(
    config: &DisplayDeviceConfig,
    session: &SessionParams,
) -> Result<Option<Rational>, ParseError> {
    match config.refresh_rate {
        RefreshRateOption::Automatic => match u32::try_from(session.fps) {
            Ok(fps) => Ok(Some(Rational::new(fps, 1))),
            Err(_) => {
                error!(fps = session.fps, "FPS provided by client session is invalid");
                Err(ParseError::InvalidSessionFps(session.fps))
            }
        },
        RefreshRateOption::Manual => match parse_refresh_rate(&config.manual_refresh_rate)? {
            Some(rate) => Ok(Some(rate)),
            None => {
                error!("Manual refresh rate must be specified");
                Err(ParseError::MissingManualRefreshRate)
            }
        },
        RefreshRateOption::Disabled => Ok(None),
    }
}

pub fn derive_hdr(config: &DisplayDeviceConfig, session: &SessionParams) -> Option<HdrState> {
    match config.hdr {
        HdrOption::Automatic if session.enable_hdr => Some(HdrState::Enabled),
        HdrOption::Automatic => Some(HdrState::Disabled),
        HdrOption::Disabled => None,
    }
}

/// Derive the configuration a session should run with
pub fn parse_configuration(
    config: &DisplayDeviceConfig,
    session: &SessionParams,
) -> ParsedConfiguration {
    let Some(device_prep) = derive_device_preparation(config.device_prep) else {
        return ParsedConfiguration::Disabled;
    };

    // Failures are already logged by the step that rejected the input
    let derived = derive_resolution(config, session).and_then(|resolution| {
        derive_refresh_rate(config, session).map(|refresh_rate| (resolution, refresh_rate))
    });
    let Ok((resolution, refresh_rate)) = derived else {
        return ParsedConfiguration::ParseFailed;
    };

    ParsedConfiguration::Configured(SingleDisplayConfiguration {
        device_id: config.output_name.clone(),
        device_prep,
        resolution,
        refresh_rate,
        hdr_state: derive_hdr(config, session),
    })
}
