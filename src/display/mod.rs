//! Display configuration model and derivation
//!
//! - **types**: value objects scheduled against the display hardware
//! - **parse**: turns user preference plus session parameters into a target configuration

pub mod parse;
pub mod types;

pub use parse::parse_configuration;
pub use types::{
    ApplyResult, DevicePreparation, EnumeratedDevice, HdrState, ParsedConfiguration, Rational,
    Resolution, SingleDisplayConfiguration,
};
