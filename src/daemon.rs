//! Display session daemon
//!
//! Owns the orchestrator for the lifetime of the process and serves CLI
//! requests over the IPC socket. Stops on an IPC `Shutdown` or SIGINT/SIGTERM;
//! the final revert runs when the shutdown handle is dropped.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

use crate::config::DisplayDeviceConfig;
use crate::ipc::{DaemonRequest, DaemonResponse, DaemonServer, ServerConnection};
use crate::orchestrator::{Orchestrator, ShutdownHandle};

/// File locations the daemon works with
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub socket: PathBuf,
    /// `None` uses the default config location
    pub config: Option<PathBuf>,
    pub persistence: PathBuf,
}

impl DaemonPaths {
    fn load_config(&self) -> Result<DisplayDeviceConfig> {
        match &self.config {
            Some(path) => DisplayDeviceConfig::load_from(path),
            None => DisplayDeviceConfig::load(),
        }
    }
}

struct DaemonState {
    paths: DaemonPaths,
    orchestrator: Orchestrator,
    config: Mutex<DisplayDeviceConfig>,
    handle: Mutex<Option<ShutdownHandle>>,
    /// Held shared by every request; set under the write lock once shutdown begins
    shutting_down: RwLock<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DaemonState {
    fn reload(&self) -> Result<()> {
        let config = self.paths.load_config()?;
        // The new handle makes the old one inert; the old scheduler is reverted once here
        let handle = self.orchestrator.initialize(&self.paths.persistence, &config);
        *lock(&self.handle) = Some(handle);
        *lock(&self.config) = config;
        info!("Reloaded display configuration");
        Ok(())
    }

    /// Refuse further requests and hand out the handle for the final revert
    fn begin_shutdown(&self) -> Option<ShutdownHandle> {
        *self.shutting_down.write().unwrap_or_else(PoisonError::into_inner) = true;
        lock(&self.handle).take()
    }

    fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        // Waits for in-flight requests before the final revert
        let shutting_down = self.shutting_down.read().unwrap_or_else(PoisonError::into_inner);
        if *shutting_down && !matches!(request, DaemonRequest::Ping) {
            debug!(?request, "Refusing request during shutdown");
            return DaemonResponse::Error("Daemon is shutting down".to_string());
        }

        match request {
            DaemonRequest::Configure(session) => {
                info!(?session, "Configuring display for session");
                let config = lock(&self.config).clone();
                self.orchestrator.configure_for_session(&config, &session);
                DaemonResponse::Ready
            }
            DaemonRequest::ConfigureExplicit(config) => {
                self.orchestrator.configure(&config);
                DaemonResponse::Ready
            }
            DaemonRequest::Revert => {
                self.orchestrator.revert();
                DaemonResponse::Ready
            }
            DaemonRequest::ResetPersistence => {
                DaemonResponse::PersistenceReset(self.orchestrator.reset_persistence())
            }
            DaemonRequest::ResolveDisplayName(name) => {
                DaemonResponse::DisplayName(self.orchestrator.resolve_display_name(&name))
            }
            DaemonRequest::ListDevices => {
                DaemonResponse::Devices(self.orchestrator.available_devices())
            }
            DaemonRequest::Reload => match self.reload() {
                Ok(()) => DaemonResponse::Ready,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Failed to reload configuration");
                    DaemonResponse::Error(format!("{e:#}"))
                }
            },
            DaemonRequest::Ping => DaemonResponse::Pong,
            // Handled by the connection loop
            DaemonRequest::Shutdown => DaemonResponse::Ready,
        }
    }
}

/// Run the daemon until shutdown is requested
pub fn run(paths: DaemonPaths) -> Result<()> {
    let config = paths.load_config()?;
    let server = DaemonServer::bind_to(paths.socket.clone())?;

    let orchestrator = Orchestrator::new();
    let handle = orchestrator.initialize(&paths.persistence, &config);
    let state = Arc::new(DaemonState {
        paths,
        orchestrator,
        config: Mutex::new(config),
        handle: Mutex::new(Some(handle)),
        shutting_down: RwLock::new(false),
    });

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    spawn_signal_listener(shutdown_tx.clone())?;
    spawn_ipc_listener(server, Arc::clone(&state), shutdown_tx)?;

    if shutdown_rx.recv().is_err() {
        warn!("All shutdown senders dropped");
    }

    info!("Shutting down daemon");
    drop(state.begin_shutdown());

    // The listener thread is still blocked in accept
    if std::fs::remove_file(&state.paths.socket).is_ok() {
        debug!(socket = %state.paths.socket.display(), "Removed daemon socket");
    }
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: mpsc::Sender<()>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received termination signal");
                shutdown_tx.send(()).ok();
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

fn spawn_ipc_listener(
    server: DaemonServer,
    state: Arc<DaemonState>,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    thread::Builder::new()
        .name("ipc".to_string())
        .spawn(move || {
            if let Err(e) = run_ipc_loop(&server, &state, &shutdown_tx) {
                error!(error = ?e, "IPC listener thread crashed");
            }
        })
        .context("Failed to spawn IPC thread")?;
    Ok(())
}

fn run_ipc_loop(
    server: &DaemonServer,
    state: &DaemonState,
    shutdown_tx: &mpsc::Sender<()>,
) -> Result<()> {
    info!(socket = %server.path().display(), "IPC listener started");

    loop {
        let mut client = server.accept()?;
        debug!("Client connected");

        if serve_client(&mut client, state) {
            info!("Received shutdown request via IPC");
            shutdown_tx.send(()).ok();
            return Ok(());
        }
        debug!("Client disconnected");
    }
}

/// Handle requests until the client hangs up; `true` when shutdown was requested
fn serve_client(client: &mut ServerConnection, state: &DaemonState) -> bool {
    loop {
        let request = match client.recv_request() {
            Ok(request) => request,
            Err(e) => {
                debug!(error = ?e, "IPC connection closed or error");
                return false;
            }
        };

        debug!(?request, "IPC request");
        let shutdown = matches!(request, DaemonRequest::Shutdown);
        let response = state.handle_request(request);

        if let Err(e) = client.send_response(&response) {
            warn!(error = ?e, "Failed to send IPC response");
            return shutdown;
        }
        if shutdown {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevicePrepOption, SessionParams};
    use crate::display::{DevicePreparation, SingleDisplayConfiguration};

    fn unsupported_state(dir: &tempfile::TempDir) -> DaemonState {
        let paths = DaemonPaths {
            socket: dir.path().join("daemon.sock"),
            config: Some(dir.path().join("config.json")),
            persistence: dir.path().join("state.json"),
        };
        let config = DisplayDeviceConfig {
            device_prep: DevicePrepOption::EnsureActive,
            ..DisplayDeviceConfig::default()
        };
        config.save_to(paths.config.as_deref().unwrap()).unwrap();

        let orchestrator = Orchestrator::new();
        let handle = orchestrator.initialize_with(&config, None);
        DaemonState {
            paths,
            orchestrator,
            config: Mutex::new(config),
            handle: Mutex::new(Some(handle)),
            shutting_down: RwLock::new(false),
        }
    }

    #[test]
    fn test_requests_on_unsupported_platform() {
        let dir = tempfile::tempdir().unwrap();
        let state = unsupported_state(&dir);

        assert!(matches!(state.handle_request(DaemonRequest::Ping), DaemonResponse::Pong));
        assert!(matches!(
            state.handle_request(DaemonRequest::ResolveDisplayName("DP-1".to_string())),
            DaemonResponse::DisplayName(name) if name == "DP-1"
        ));
        assert!(matches!(
            state.handle_request(DaemonRequest::ResetPersistence),
            DaemonResponse::PersistenceReset(true)
        ));
        assert!(matches!(
            state.handle_request(DaemonRequest::ListDevices),
            DaemonResponse::Devices(devices) if devices.is_empty()
        ));
        assert!(matches!(
            state.handle_request(DaemonRequest::Configure(SessionParams::default())),
            DaemonResponse::Ready
        ));
        assert!(matches!(
            state.handle_request(DaemonRequest::ConfigureExplicit(SingleDisplayConfiguration::new(
                "DP-1",
                DevicePreparation::EnsureActive
            ))),
            DaemonResponse::Ready
        ));
        assert!(matches!(state.handle_request(DaemonRequest::Revert), DaemonResponse::Ready));
    }

    #[test]
    fn test_reload_with_broken_config_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = unsupported_state(&dir);
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();

        assert!(matches!(state.handle_request(DaemonRequest::Reload), DaemonResponse::Error(_)));
        // Previous configuration stays in effect
        assert_eq!(lock(&state.config).device_prep, DevicePrepOption::EnsureActive);
    }

    #[test]
    fn test_requests_refused_after_shutdown_begins() {
        let dir = tempfile::tempdir().unwrap();
        let state = unsupported_state(&dir);

        let handle = state.begin_shutdown();
        assert!(handle.is_some());
        drop(handle);

        assert!(matches!(state.handle_request(DaemonRequest::Reload), DaemonResponse::Error(_)));
        assert!(lock(&state.handle).is_none());
        assert!(matches!(
            state.handle_request(DaemonRequest::Configure(SessionParams::default())),
            DaemonResponse::Error(_)
        ));
        assert!(matches!(state.handle_request(DaemonRequest::Ping), DaemonResponse::Pong));
    }
}
