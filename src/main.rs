#![forbid(unsafe_code)]

mod audio;
mod config;
mod constants;
mod daemon;
mod display;
mod ipc;
mod orchestrator;
mod scheduler;
mod settings_manager;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{debug, Level as TraceLevel};
use tracing_subscriber::FmtSubscriber;

use config::{default_persistence_path, DisplayDeviceConfig, SessionParams};
use daemon::DaemonPaths;
use display::parse::{parse_refresh_rate, parse_resolution};
use display::{
    parse_configuration, DevicePreparation, HdrState, ParsedConfiguration,
    SingleDisplayConfiguration,
};
use ipc::{DaemonClient, DaemonRequest, DaemonResponse};

#[derive(Parser)]
#[command(name = "display-session", version, about = "Match the display configuration to a streaming session")]
struct Cli {
    /// Daemon socket (default: $XDG_RUNTIME_DIR/display-session/daemon.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the daemon owning the display configuration
    Daemon {
        /// User config file (default: ~/.config/display-session/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Saved pre-change display state
        #[arg(long)]
        persistence: Option<PathBuf>,
    },
    /// Configure the display for a session using the daemon's user config
    Configure(SessionArgs),
    /// Apply an explicit configuration
    Apply(ApplyArgs),
    /// Restore the display configuration from before the first change
    Revert,
    /// Cancel pending work and forget the saved display state
    Reset,
    /// Resolve a device id to its display name (empty for the primary display)
    Resolve {
        #[arg(default_value = "")]
        device_id: String,
    },
    /// List display devices
    Devices,
    /// Re-read the user config in the daemon
    Reload,
    /// Check that the daemon is running
    Ping,
    /// Stop the daemon, reverting the display configuration
    Shutdown,
    /// Print the configuration a session would get, without contacting the daemon
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Session width in pixels; negative when not provided
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    width: i32,
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    height: i32,
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    fps: i32,
    /// Client asked to optimize game settings
    #[arg(long)]
    sops: bool,
    /// Client requested HDR
    #[arg(long)]
    hdr: bool,
}

impl From<SessionArgs> for SessionParams {
    fn from(args: SessionArgs) -> Self {
        Self {
            enable_sops: args.sops,
            width: args.width,
            height: args.height,
            fps: args.fps,
            enable_hdr: args.hdr,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PrepArg {
    VerifyOnly,
    EnsureActive,
    EnsurePrimary,
    EnsureOnlyDisplay,
}

impl From<PrepArg> for DevicePreparation {
    fn from(arg: PrepArg) -> Self {
        match arg {
            PrepArg::VerifyOnly => Self::VerifyOnly,
            PrepArg::EnsureActive => Self::EnsureActive,
            PrepArg::EnsurePrimary => Self::EnsurePrimary,
            PrepArg::EnsureOnlyDisplay => Self::EnsureOnlyDisplay,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum HdrArg {
    On,
    Off,
}

#[derive(Args)]
struct ApplyArgs {
    /// Output name; empty for the primary display
    #[arg(long, default_value = "")]
    device: String,
    #[arg(long, value_enum, default_value = "verify-only")]
    prep: PrepArg,
    /// WIDTHxHEIGHT
    #[arg(long)]
    resolution: Option<String>,
    /// N or N.F
    #[arg(long)]
    refresh_rate: Option<String>,
    #[arg(long, value_enum)]
    hdr: Option<HdrArg>,
}

impl ApplyArgs {
    fn into_configuration(self) -> Result<SingleDisplayConfiguration> {
        let mut config = SingleDisplayConfiguration::new(self.device, self.prep.into());
        if let Some(resolution) = self.resolution {
            config.resolution = parse_resolution(&resolution)?;
        }
        if let Some(refresh_rate) = self.refresh_rate {
            config.refresh_rate = parse_refresh_rate(&refresh_rate)?;
        }
        config.hdr_state = self.hdr.map(|hdr| match hdr {
            HdrArg::On => HdrState::Enabled,
            HdrArg::Off => HdrState::Disabled,
        });
        Ok(config)
    }
}

fn init_logging() -> Result<()> {
    let log_level = match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn send(socket: &Option<PathBuf>, request: DaemonRequest) -> Result<DaemonResponse> {
    let path = match socket {
        Some(path) => path.clone(),
        None => ipc::default_socket_path()?,
    };
    debug!(socket = %path.display(), ?request, "Sending request");

    let mut client = DaemonClient::connect_to(&path)?;
    match client.request(&request)? {
        DaemonResponse::Error(message) => bail!("Daemon error: {message}"),
        response => Ok(response),
    }
}

fn expect_ready(response: DaemonResponse) -> Result<()> {
    match response {
        DaemonResponse::Ready => Ok(()),
        other => bail!("Unexpected response: {other:?}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Cmd::Daemon { config, persistence } => daemon::run(DaemonPaths {
            socket: match cli.socket {
                Some(path) => path,
                None => ipc::default_socket_path()?,
            },
            config,
            persistence: persistence.unwrap_or_else(default_persistence_path),
        }),
        Cmd::Configure(session) => {
            expect_ready(send(&cli.socket, DaemonRequest::Configure(session.into()))?)
        }
        Cmd::Apply(args) => {
            let config = args.into_configuration()?;
            expect_ready(send(&cli.socket, DaemonRequest::ConfigureExplicit(config))?)
        }
        Cmd::Revert => expect_ready(send(&cli.socket, DaemonRequest::Revert)?),
        Cmd::Reload => expect_ready(send(&cli.socket, DaemonRequest::Reload)?),
        Cmd::Shutdown => expect_ready(send(&cli.socket, DaemonRequest::Shutdown)?),
        Cmd::Reset => match send(&cli.socket, DaemonRequest::ResetPersistence)? {
            DaemonResponse::PersistenceReset(true) => Ok(()),
            DaemonResponse::PersistenceReset(false) => bail!("Failed to reset persisted display state"),
            other => bail!("Unexpected response: {other:?}"),
        },
        Cmd::Resolve { device_id } => {
            match send(&cli.socket, DaemonRequest::ResolveDisplayName(device_id.clone()))? {
                DaemonResponse::DisplayName(name) if name.is_empty() => {
                    bail!("No display device matches {device_id:?}")
                }
                DaemonResponse::DisplayName(name) => {
                    println!("{name}");
                    Ok(())
                }
                other => bail!("Unexpected response: {other:?}"),
            }
        }
        Cmd::Devices => match send(&cli.socket, DaemonRequest::ListDevices)? {
            DaemonResponse::Devices(devices) => {
                println!("{}", serde_json::to_string_pretty(&devices)?);
                Ok(())
            }
            other => bail!("Unexpected response: {other:?}"),
        },
        Cmd::Ping => match send(&cli.socket, DaemonRequest::Ping)? {
            DaemonResponse::Pong => {
                println!("pong");
                Ok(())
            }
            other => bail!("Unexpected response: {other:?}"),
        },
        Cmd::Check { config, session } => {
            let config = match config {
                Some(path) => DisplayDeviceConfig::load_from(&path)?,
                None => DisplayDeviceConfig::load()?,
            };
            match parse_configuration(&config, &session.into()) {
                ParsedConfiguration::Configured(parsed) => {
                    let json = serde_json::to_string_pretty(&parsed)
                        .context("Failed to serialize configuration")?;
                    println!("{json}");
                    Ok(())
                }
                ParsedConfiguration::Disabled => {
                    println!("disabled");
                    Ok(())
                }
                ParsedConfiguration::ParseFailed => bail!("Display configuration could not be derived"),
            }
        }
    }
}
