//! Session display orchestration
//!
//! [`Orchestrator`] owns the one retry scheduler bound to the platform
//! settings manager. Every request takes the same lock, so top-level
//! requests are serialized while retries run on the scheduler's worker.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::{AudioContext, AudioSessionProvider, SessionAudioContext, SharedAudioSession};
use crate::config::{DisplayDeviceConfig, SessionParams};
use crate::constants;
use crate::display::{
    parse_configuration, ApplyResult, EnumeratedDevice, ParsedConfiguration,
    SingleDisplayConfiguration,
};
use crate::scheduler::{Decision, RetryScheduler, SchedulerOptions, TaskState};
use crate::settings_manager::{self, SettingsManager};

/// Resource driven by the retry scheduler
pub struct ManagedDisplay {
    settings: Box<dyn SettingsManager>,
    audio: Box<dyn AudioContext>,
}

impl ManagedDisplay {
    fn apply(&mut self, config: &SingleDisplayConfiguration) -> Decision {
        // Keep the audio session alive while other displays may go away
        if config.may_disable_displays() && !self.audio.capture() {
            debug!("Applying without an audio session to preserve");
        }

        match self.settings.apply(config) {
            ApplyResult::Ok => Decision::Stop,
            ApplyResult::ApiTemporarilyUnavailable => {
                debug!(device = %config.device_id, "Display API busy, will retry");
                Decision::Continue
            }
            ApplyResult::PermanentFailure => {
                warn!(device = %config.device_id, "Failed to apply display configuration, not retrying");
                Decision::Stop
            }
        }
    }

    fn revert(&mut self) -> bool {
        let reverted = self.settings.revert();
        if reverted {
            self.audio.release();
        }
        reverted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevertOption {
    /// Single attempt, used for teardown
    TryOnce,
    TryIndefinitely,
    /// Like `TryIndefinitely`, but the first attempt waits for the revert delay
    TryIndefinitelyWithDelay,
}

struct OrchestratorState {
    revert_delay: Duration,
    /// `None` when uninitialized or the platform is unsupported
    scheduler: Option<RetryScheduler<ManagedDisplay>>,
    /// Bumped on every initialization so stale shutdown handles stay inert
    generation: u64,
}

impl OrchestratorState {
    fn revert(&self, option: RevertOption, retry_interval: Duration) {
        let Some(scheduler) = self.scheduler.as_ref() else {
            return;
        };

        let options = match option {
            RevertOption::TryIndefinitelyWithDelay if !self.revert_delay.is_zero() => {
                SchedulerOptions::delayed(retry_interval, self.revert_delay)
            }
            _ => SchedulerOptions::new(retry_interval),
        };
        let try_once = option == RevertOption::TryOnce;

        debug!(?option, "Scheduling display revert");
        scheduler.schedule(
            move |display: &mut ManagedDisplay| {
                if display.revert() || try_once {
                    Decision::Stop
                } else {
                    Decision::Continue
                }
            },
            options,
        );
    }

    fn teardown(&mut self, retry_interval: Duration) {
        if self.scheduler.is_none() {
            return;
        }
        self.revert(RevertOption::TryOnce, retry_interval);
        // Dropping the scheduler joins its worker
        self.scheduler = None;
    }
}

/// Shared handle to the display orchestration state. Clones refer to the same state.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<Mutex<OrchestratorState>>,
    retry_interval: Duration,
    audio: Arc<dyn AudioSessionProvider + Sync>,
    audio_settle_delay: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OrchestratorState {
                revert_delay: Duration::ZERO,
                scheduler: None,
                generation: 0,
            })),
            retry_interval: constants::retry::DEFAULT_INTERVAL,
            audio: Arc::new(SharedAudioSession::new()),
            audio_settle_delay: constants::audio::RELEASE_SETTLE_DELAY,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Source of the audio session held while other displays are off
    pub fn with_audio_provider(mut self, provider: impl AudioSessionProvider + Sync + 'static) -> Self {
        self.audio = Arc::new(provider);
        self
    }

    pub fn with_audio_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.audio_settle_delay = settle_delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)initialize against the platform backend
    pub fn initialize(&self, persistence_path: &Path, config: &DisplayDeviceConfig) -> ShutdownHandle {
        let settings = settings_manager::make_settings_manager(persistence_path, config);
        self.initialize_with(config, settings)
    }

    /// (Re)initialize with an already constructed settings manager; `None` means unsupported
    pub fn initialize_with(
        &self,
        config: &DisplayDeviceConfig,
        settings: Option<Box<dyn SettingsManager>>,
    ) -> ShutdownHandle {
        let mut state = self.lock();

        state.teardown(self.retry_interval);
        state.generation = state.generation.wrapping_add(1);
        state.revert_delay = config.revert_delay();

        match settings {
            Some(mut settings) => {
                let devices = settings.enumerate_available_devices();
                info!(count = devices.len(), "Display devices available");
                for device in &devices {
                    info!(
                        device = %device.device_id,
                        active = device.active,
                        primary = device.primary,
                        resolution = ?device.resolution.map(|r| r.to_string()),
                        refresh_rate = ?device.refresh_rate.map(|r| r.as_hz()),
                        "Display device"
                    );
                }

                let audio = SessionAudioContext::new(Arc::clone(&self.audio))
                    .with_settle_delay(self.audio_settle_delay);
                state.scheduler = Some(RetryScheduler::new(ManagedDisplay {
                    settings,
                    audio: Box::new(audio),
                }));

                // A previous process may have exited with the display still changed
                state.revert(RevertOption::TryIndefinitely, self.retry_interval);
            }
            None => info!("Display management unsupported, requests will be ignored"),
        }

        ShutdownHandle {
            state: Arc::clone(&self.state),
            generation: state.generation,
            retry_interval: self.retry_interval,
        }
    }

    /// Apply `config`, retrying while the display API is temporarily unavailable
    pub fn configure(&self, config: &SingleDisplayConfiguration) {
        let state = self.lock();
        let Some(scheduler) = state.scheduler.as_ref() else {
            debug!("Display management unsupported, ignoring configuration");
            return;
        };

        info!(
            device = %config.device_id,
            device_prep = ?config.device_prep,
            resolution = ?config.resolution.map(|r| r.to_string()),
            refresh_rate = ?config.refresh_rate.map(|r| r.to_string()),
            hdr = ?config.hdr_state,
            "Configuring display"
        );

        let config = config.clone();
        scheduler.schedule(
            move |display: &mut ManagedDisplay| display.apply(&config),
            SchedulerOptions::new(self.retry_interval),
        );
    }

    /// Derive the configuration for a session and apply it, revert, or do nothing
    pub fn configure_for_session(&self, config: &DisplayDeviceConfig, session: &SessionParams) {
        match parse_configuration(config, session) {
            ParsedConfiguration::Configured(parsed) => self.configure(&parsed),
            ParsedConfiguration::Disabled => self.revert(),
            ParsedConfiguration::ParseFailed => {
                debug!("Keeping current display configuration after parse failure");
            }
        }
    }

    /// Revert until it succeeds; the first attempt waits for the revert delay
    pub fn revert(&self) {
        self.lock()
            .revert(RevertOption::TryIndefinitelyWithDelay, self.retry_interval);
    }

    /// Cancel any pending apply or revert and forget the saved display state
    pub fn reset_persistence(&self) -> bool {
        let state = self.lock();
        match state.scheduler.as_ref() {
            Some(scheduler) => {
                scheduler.cancel_and_execute(|display| display.settings.reset_persistence())
            }
            None => true,
        }
    }

    /// Canonical display name; the input itself when unsupported
    pub fn resolve_display_name(&self, device_id: &str) -> String {
        let state = self.lock();
        match state.scheduler.as_ref() {
            Some(scheduler) => {
                scheduler.execute(|display| display.settings.resolve_display_name(device_id))
            }
            None => device_id.to_string(),
        }
    }

    pub fn available_devices(&self) -> Vec<EnumeratedDevice> {
        let state = self.lock();
        match state.scheduler.as_ref() {
            Some(scheduler) => {
                scheduler.execute(|display| display.settings.enumerate_available_devices())
            }
            None => Vec::new(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.lock().scheduler.is_some()
    }

    /// State of the pending apply or revert loop
    pub fn task_state(&self) -> TaskState {
        self.lock()
            .scheduler
            .as_ref()
            .map_or(TaskState::Stopped, RetryScheduler::state)
    }
}

/// Reverts once and tears the scheduler down when dropped.
/// Inert once the orchestrator has been initialized again.
#[must_use = "dropping the handle reverts the display configuration"]
pub struct ShutdownHandle {
    state: Arc<Mutex<OrchestratorState>>,
    generation: u64,
    retry_interval: Duration,
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation != self.generation {
            debug!("Stale shutdown handle dropped");
            return;
        }

        info!("Shutting down display management");
        state.teardown(self.retry_interval);
    }
}
