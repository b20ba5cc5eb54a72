//! RandR-backed settings manager for X11 sessions
//!
//! Device ids are RandR output names (`HDMI-1`, `DP-2`, ...). The layout of
//! every CRTC is saved before the first change and restored on revert. A
//! lost connection is reopened on the next call.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::{ConnectError, ConnectionError, ReplyError};
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt, SetConfig};
use x11rb::protocol::xproto::{ConnectionExt as XprotoExt, Timestamp, Window};
use x11rb::rust_connection::RustConnection;
use x11rb::CURRENT_TIME;

use super::{SettingsManager, SettingsPersistence, Workarounds};
use crate::constants::randr as tuning;
use crate::display::{
    ApplyResult, DevicePreparation, EnumeratedDevice, Rational, Resolution,
    SingleDisplayConfiguration,
};

/// RandR rotation bits: Rotate_0 = 1, Rotate_90 = 2, Rotate_180 = 4, Rotate_270 = 8
const ROTATE_0: u16 = 1;
const SIDEWAYS: u16 = 2 | 8;

/// Layout of one CRTC, keyed by output names since output ids are per server instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrtcLayout {
    pub outputs: Vec<String>,
    pub x: i16,
    pub y: i16,
    /// Mode size, before rotation
    pub width: u16,
    pub height: u16,
    pub refresh_mhz: u32,
    pub rotation: u16,
}

/// Display state captured before the first change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub primary: Option<String>,
    pub crtcs: Vec<CrtcLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModeEntry {
    id: randr::Mode,
    width: u16,
    height: u16,
    refresh_mhz: u32,
}

impl From<&randr::ModeInfo> for ModeEntry {
    fn from(mode: &randr::ModeInfo) -> Self {
        Self {
            id: mode.id,
            width: mode.width,
            height: mode.height,
            refresh_mhz: refresh_mhz(mode.dot_clock, mode.htotal, mode.vtotal),
        }
    }
}

#[derive(Debug, Clone)]
struct OutputState {
    id: randr::Output,
    name: String,
    connected: bool,
    /// 0 when inactive
    crtc: randr::Crtc,
    crtcs: Vec<randr::Crtc>,
    /// Preferred modes first
    modes: Vec<randr::Mode>,
}

#[derive(Debug, Clone)]
struct CrtcState {
    id: randr::Crtc,
    x: i16,
    y: i16,
    width: u16,
    height: u16,
    /// 0 when disabled
    mode: randr::Mode,
    rotation: u16,
    outputs: Vec<randr::Output>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CrtcChange {
    crtc: randr::Crtc,
    x: i16,
    y: i16,
    mode: randr::Mode,
    /// Screen area covered, after rotation
    width: u16,
    height: u16,
    rotation: u16,
    outputs: Vec<randr::Output>,
}

impl CrtcChange {
    fn disable(crtc: randr::Crtc) -> Self {
        Self {
            crtc,
            x: 0,
            y: 0,
            mode: 0,
            width: 0,
            height: 0,
            rotation: ROTATE_0,
            outputs: Vec::new(),
        }
    }

    fn enables(&self) -> bool {
        self.mode != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Plan {
    changes: Vec<CrtcChange>,
    /// `Some(0)` clears the primary output
    primary: Option<randr::Output>,
    screen: (u16, u16),
}

fn refresh_mhz(dot_clock: u32, htotal: u16, vtotal: u16) -> u32 {
    let frame = u64::from(htotal) * u64::from(vtotal);
    if frame == 0 {
        return 0;
    }
    u32::try_from(u64::from(dot_clock) * 1000 / frame).unwrap_or(u32::MAX)
}

fn rational_to_mhz(rate: Rational) -> u32 {
    (rate.as_hz() * 1000.0).round() as u32
}

fn oriented(width: u16, height: u16, rotation: u16) -> (u16, u16) {
    if rotation & SIDEWAYS != 0 {
        (height, width)
    } else {
        (width, height)
    }
}

fn clamp_u16(value: i32) -> u16 {
    u16::try_from(value.max(0)).unwrap_or(u16::MAX)
}

/// Server state read in one pass
#[derive(Debug, Clone)]
struct Topology {
    config_timestamp: Timestamp,
    modes: Vec<ModeEntry>,
    outputs: Vec<OutputState>,
    crtcs: Vec<CrtcState>,
    primary: randr::Output,
    screen: (u16, u16),
    /// Largest screen the server accepts
    screen_max: (u16, u16),
}

impl Topology {
    /// Empty id selects the primary output, falling back to the first active one
    fn find_output(&self, device_id: &str) -> Option<&OutputState> {
        let connected = || self.outputs.iter().filter(|o| o.connected);
        if device_id.is_empty() {
            return connected()
                .find(|o| o.id == self.primary)
                .or_else(|| connected().find(|o| o.crtc != 0));
        }
        connected().find(|o| o.name.eq_ignore_ascii_case(device_id))
    }

    fn crtc(&self, id: randr::Crtc) -> Option<&CrtcState> {
        self.crtcs.iter().find(|c| c.id == id)
    }

    fn mode(&self, id: randr::Mode) -> Option<&ModeEntry> {
        self.modes.iter().find(|m| m.id == id)
    }

    /// Closest refresh within tolerance when `target_mhz` is given, otherwise the fastest mode
    fn select_mode(
        &self,
        output: &OutputState,
        width: u16,
        height: u16,
        target_mhz: Option<u32>,
    ) -> Option<ModeEntry> {
        let candidates = output
            .modes
            .iter()
            .filter_map(|id| self.mode(*id))
            .filter(|m| m.width == width && m.height == height);

        let tolerance_mhz = (tuning::REFRESH_TOLERANCE_HZ * 1000.0) as u32;
        match target_mhz {
            Some(target) => candidates
                .min_by_key(|m| m.refresh_mhz.abs_diff(target))
                .filter(|m| m.refresh_mhz.abs_diff(target) <= tolerance_mhz),
            None => candidates.max_by_key(|m| m.refresh_mhz),
        }
        .copied()
    }

    fn is_current(&self, change: &CrtcChange) -> bool {
        self.crtc(change.crtc).is_some_and(|c| {
            if !change.enables() {
                return c.mode == 0;
            }
            c.mode == change.mode
                && c.x == change.x
                && c.y == change.y
                && c.rotation == change.rotation
                && c.outputs == change.outputs
        })
    }

    /// Bounding box of every enabled CRTC once `changes` are applied
    fn screen_after(&self, changes: &[CrtcChange]) -> (u16, u16) {
        let untouched = self
            .crtcs
            .iter()
            .filter(|c| c.mode != 0 && !changes.iter().any(|ch| ch.crtc == c.id))
            .map(|c| (c.x, c.y, c.width, c.height));
        let changed = changes
            .iter()
            .filter(|ch| ch.enables())
            .map(|ch| (ch.x, ch.y, ch.width, ch.height));

        let size = untouched
            .chain(changed)
            .fold((0u16, 0u16), |(w, h), (x, y, cw, ch)| {
                let right = clamp_u16(i32::from(x) + i32::from(cw));
                let bottom = clamp_u16(i32::from(y) + i32::from(ch));
                (w.max(right), h.max(bottom))
            });

        if size == (0, 0) { self.screen } else { size }
    }

    fn snapshot(&self) -> TopologySnapshot {
        let name_of = |id: &randr::Output| {
            self.outputs
                .iter()
                .find(|o| o.id == *id)
                .map(|o| o.name.clone())
        };

        let crtcs = self
            .crtcs
            .iter()
            .filter(|c| c.mode != 0 && !c.outputs.is_empty())
            .filter_map(|c| {
                let mode = self.mode(c.mode)?;
                Some(CrtcLayout {
                    outputs: c.outputs.iter().filter_map(name_of).collect(),
                    x: c.x,
                    y: c.y,
                    width: mode.width,
                    height: mode.height,
                    refresh_mhz: mode.refresh_mhz,
                    rotation: c.rotation,
                })
            })
            .collect();

        TopologySnapshot {
            primary: name_of(&self.primary),
            crtcs,
        }
    }

    fn devices(&self) -> Vec<EnumeratedDevice> {
        self.outputs
            .iter()
            .filter(|o| o.connected)
            .map(|o| {
                let crtc = self.crtc(o.crtc).filter(|c| c.mode != 0);
                let mode = crtc.and_then(|c| self.mode(c.mode));
                EnumeratedDevice {
                    device_id: o.name.clone(),
                    display_name: o.name.clone(),
                    active: crtc.is_some(),
                    primary: o.id == self.primary,
                    resolution: crtc
                        .map(|c| Resolution::new(u32::from(c.width), u32::from(c.height))),
                    refresh_rate: mode.map(|m| Rational::new(m.refresh_mhz, 1000)),
                }
            })
            .collect()
    }

    /// Changes bringing `output` into the requested state, `None` when unsatisfiable
    fn apply_plan(&self, output: &OutputState, config: &SingleDisplayConfiguration) -> Option<Plan> {
        let only_display = config.device_prep == DevicePreparation::EnsureOnlyDisplay;
        let current = self.crtc(output.crtc).filter(|c| c.mode != 0);

        let crtc_id = match current {
            Some(crtc) => crtc.id,
            None => {
                let free = output
                    .crtcs
                    .iter()
                    .copied()
                    .find(|id| self.crtc(*id).is_some_and(|c| c.outputs.is_empty()));
                let Some(free) = free else {
                    error!(device = %output.name, "No free CRTC to activate display device");
                    return None;
                };
                free
            }
        };

        let base = current
            .and_then(|c| self.mode(c.mode))
            .or_else(|| output.modes.first().and_then(|id| self.mode(*id)))
            .copied();
        let Some(base) = base else {
            error!(device = %output.name, "Display device advertises no modes");
            return None;
        };

        let (width, height) = match config.resolution {
            Some(resolution) => {
                match (u16::try_from(resolution.width), u16::try_from(resolution.height)) {
                    (Ok(width), Ok(height)) => (width, height),
                    _ => {
                        error!(device = %output.name, %resolution, "Resolution exceeds what RandR can address");
                        return None;
                    }
                }
            }
            None => (base.width, base.height),
        };

        // Without an explicit refresh rate keep the current one when the size is unchanged
        let target_mhz = config.refresh_rate.map(rational_to_mhz).or_else(|| {
            (width == base.width && height == base.height).then_some(base.refresh_mhz)
        });
        let Some(mode) = self.select_mode(output, width, height, target_mhz) else {
            error!(
                device = %output.name,
                width,
                height,
                refresh_mhz = ?target_mhz,
                "Display device has no matching mode"
            );
            return None;
        };

        let rotation = current.map_or(ROTATE_0, |c| c.rotation);
        let (x, y) = match current {
            _ if only_display => (0, 0),
            Some(c) => (c.x, c.y),
            // Append newly activated displays to the right of the desktop
            None => (i16::try_from(self.screen_after(&[]).0).unwrap_or(i16::MAX), 0),
        };
        let (area_width, area_height) = oriented(mode.width, mode.height, rotation);

        let mut changes = Vec::new();
        if only_display {
            changes.extend(
                self.crtcs
                    .iter()
                    .filter(|c| c.mode != 0 && c.id != crtc_id)
                    .map(|c| CrtcChange::disable(c.id)),
            );
        }
        changes.push(CrtcChange {
            crtc: crtc_id,
            x,
            y,
            mode: mode.id,
            width: area_width,
            height: area_height,
            rotation,
            outputs: current.map_or_else(|| vec![output.id], |c| c.outputs.clone()),
        });
        changes.retain(|change| !self.is_current(change));

        let wants_primary = matches!(
            config.device_prep,
            DevicePreparation::EnsurePrimary | DevicePreparation::EnsureOnlyDisplay
        );
        let primary = (wants_primary && self.primary != output.id).then_some(output.id);

        let screen = self.screen_after(&changes);
        if screen.0 > self.screen_max.0 || screen.1 > self.screen_max.1 {
            error!(
                device = %output.name,
                width = screen.0,
                height = screen.1,
                max_width = self.screen_max.0,
                max_height = self.screen_max.1,
                "Resulting screen exceeds the maximum size"
            );
            return None;
        }

        Some(Plan {
            screen,
            changes,
            primary,
        })
    }

    /// Changes bringing the server back to `snapshot`, `None` when a saved
    /// output or mode is not available right now
    fn restore_plan(&self, snapshot: &TopologySnapshot) -> Option<Plan> {
        let mut used: Vec<randr::Crtc> = Vec::new();
        let mut enabled = Vec::new();

        for layout in &snapshot.crtcs {
            let outputs: Option<Vec<&OutputState>> = layout
                .outputs
                .iter()
                .map(|name| self.outputs.iter().find(|o| o.connected && o.name == *name))
                .collect();
            let Some(outputs) = outputs.filter(|o| !o.is_empty()) else {
                warn!(outputs = ?layout.outputs, "Saved display device is not connected");
                return None;
            };
            let first = outputs[0];

            let Some(mode) = self.select_mode(first, layout.width, layout.height, Some(layout.refresh_mhz)) else {
                warn!(device = %first.name, width = layout.width, height = layout.height, "Saved mode is not available");
                return None;
            };

            // Prefer the CRTC the output is already on to avoid moving it
            let crtc = std::iter::once(first.crtc)
                .chain(first.crtcs.iter().copied())
                .find(|id| *id != 0 && !used.contains(id) && self.crtc(*id).is_some());
            let Some(crtc) = crtc else {
                warn!(device = %first.name, "No CRTC available to restore display device");
                return None;
            };
            used.push(crtc);

            let (width, height) = oriented(mode.width, mode.height, layout.rotation);
            enabled.push(CrtcChange {
                crtc,
                x: layout.x,
                y: layout.y,
                mode: mode.id,
                width,
                height,
                rotation: layout.rotation,
                outputs: outputs.iter().map(|o| o.id).collect(),
            });
        }

        let mut changes: Vec<CrtcChange> = self
            .crtcs
            .iter()
            .filter(|c| c.mode != 0 && !used.contains(&c.id))
            .map(|c| CrtcChange::disable(c.id))
            .collect();
        changes.extend(enabled);
        changes.retain(|change| !self.is_current(change));

        let primary = match &snapshot.primary {
            Some(name) => self.outputs.iter().find(|o| o.name == *name).map(|o| o.id),
            None => Some(0),
        }
        .filter(|id| *id != self.primary);

        Some(Plan {
            screen: self.screen_after(&changes),
            changes,
            primary,
        })
    }
}

/// Live connection to the X server and the root window RandR requests go to
struct Display {
    conn: RustConnection,
    root: Window,
    screen_num: usize,
    randr_version: (u32, u32),
}

impl Display {
    /// Connect and check that RandR is present and recent enough; `None` uses `$DISPLAY`
    fn open(name: Option<&str>) -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(name).context("Failed to connect to the X server")?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| anyhow!("X server has no screen {screen_num}"))?;

        if conn
            .extension_information(randr::X11_EXTENSION_NAME)
            .context("Failed to query RandR extension")?
            .is_none()
        {
            bail!("RandR extension is not available");
        }

        let version = conn
            .randr_query_version(tuning::MIN_MAJOR_VERSION, tuning::MIN_MINOR_VERSION)
            .context("Failed to send RandR QueryVersion")?
            .reply()
            .context("RandR QueryVersion failed")?;
        let randr_version = (version.major_version, version.minor_version);
        if randr_version < (tuning::MIN_MAJOR_VERSION, tuning::MIN_MINOR_VERSION) {
            bail!(
                "RandR {}.{} is too old, {}.{} required",
                version.major_version,
                version.minor_version,
                tuning::MIN_MAJOR_VERSION,
                tuning::MIN_MINOR_VERSION
            );
        }

        Ok(Self {
            conn,
            root,
            screen_num,
            randr_version,
        })
    }

    fn read_topology(&self) -> Result<Topology> {
        let resources = self
            .conn
            .randr_get_screen_resources_current(self.root)
            .context("Failed to send RandR GetScreenResourcesCurrent")?
            .reply()
            .context("RandR GetScreenResourcesCurrent failed")?;

        let mut outputs = Vec::with_capacity(resources.outputs.len());
        for &id in &resources.outputs {
            let info = self
                .conn
                .randr_get_output_info(id, resources.config_timestamp)?
                .reply()
                .with_context(|| format!("RandR GetOutputInfo failed for output {id}"))?;
            outputs.push(OutputState {
                id,
                name: String::from_utf8_lossy(&info.name).into_owned(),
                connected: info.connection == randr::Connection::CONNECTED,
                crtc: info.crtc,
                crtcs: info.crtcs,
                modes: info.modes,
            });
        }

        let mut crtcs = Vec::with_capacity(resources.crtcs.len());
        for &id in &resources.crtcs {
            let info = self
                .conn
                .randr_get_crtc_info(id, resources.config_timestamp)?
                .reply()
                .with_context(|| format!("RandR GetCrtcInfo failed for CRTC {id}"))?;
            crtcs.push(CrtcState {
                id,
                x: info.x,
                y: info.y,
                width: info.width,
                height: info.height,
                mode: info.mode,
                rotation: u16::from(info.rotation),
                outputs: info.outputs,
            });
        }

        let primary = self
            .conn
            .randr_get_output_primary(self.root)?
            .reply()
            .context("RandR GetOutputPrimary failed")?
            .output;
        let geometry = self
            .conn
            .get_geometry(self.root)?
            .reply()
            .context("Failed to query root window geometry")?;
        let range = self
            .conn
            .randr_get_screen_size_range(self.root)?
            .reply()
            .context("RandR GetScreenSizeRange failed")?;

        Ok(Topology {
            config_timestamp: resources.config_timestamp,
            modes: resources.modes.iter().map(ModeEntry::from).collect(),
            outputs,
            crtcs,
            primary,
            screen: (geometry.width, geometry.height),
            screen_max: (range.max_width, range.max_height),
        })
    }

    fn set_crtc(&self, config_timestamp: Timestamp, change: &CrtcChange) -> Result<SetConfig> {
        let reply = self
            .conn
            .randr_set_crtc_config(
                change.crtc,
                CURRENT_TIME,
                config_timestamp,
                change.x,
                change.y,
                change.mode,
                randr::Rotation::from(change.rotation),
                &change.outputs,
            )
            .context("Failed to send RandR SetCrtcConfig")?
            .reply()
            .with_context(|| format!("RandR SetCrtcConfig failed for CRTC {}", change.crtc))?;

        debug!(crtc = change.crtc, mode = change.mode, x = change.x, y = change.y, "Configured CRTC");
        Ok(reply.status)
    }

    fn set_screen_size(&self, (width, height): (u16, u16)) -> Result<()> {
        let to_mm = |px: u16| {
            (f64::from(px) * tuning::MM_PER_INCH / tuning::NOMINAL_DPI).round() as u32
        };
        self.conn
            .randr_set_screen_size(self.root, width, height, to_mm(width), to_mm(height))?
            .check()
            .with_context(|| format!("RandR SetScreenSize failed for {width}x{height}"))?;
        debug!(width, height, "Resized screen");
        Ok(())
    }

    /// Disable first, grow the screen, enable, then settle on the final size
    fn execute_plan(&self, topology: &Topology, plan: &Plan) -> Result<ApplyResult> {
        let (disables, enables): (Vec<&CrtcChange>, Vec<&CrtcChange>) =
            plan.changes.iter().partition(|change| !change.enables());

        for change in disables {
            if let Some(result) = status_result(self.set_crtc(topology.config_timestamp, change)?) {
                return Ok(result);
            }
        }

        let union = (
            plan.screen.0.max(topology.screen.0),
            plan.screen.1.max(topology.screen.1),
        );
        if union != topology.screen {
            self.set_screen_size(union)?;
        }

        for change in enables {
            if let Some(result) = status_result(self.set_crtc(topology.config_timestamp, change)?) {
                return Ok(result);
            }
        }

        if plan.screen != union {
            self.set_screen_size(plan.screen)?;
        }

        if let Some(primary) = plan.primary {
            self.conn
                .randr_set_output_primary(self.root, primary)?
                .check()
                .context("RandR SetOutputPrimary failed")?;
        }

        self.conn.flush()?;
        Ok(ApplyResult::Ok)
    }

    fn restore(&self, snapshot: &TopologySnapshot) -> Result<bool> {
        let topology = self.read_topology()?;
        let Some(plan) = topology.restore_plan(snapshot) else {
            return Ok(false);
        };
        Ok(self.execute_plan(&topology, &plan)? == ApplyResult::Ok)
    }
}

pub struct X11SettingsManager {
    /// Display to reconnect to; `None` for `$DISPLAY`
    display_name: Option<String>,
    /// `None` after a transport failure until the next call reconnects
    display: Option<Display>,
    persistence: SettingsPersistence,
    workarounds: Workarounds,
}

impl X11SettingsManager {
    /// Connect to the X server; fails when RandR is missing or too old
    pub fn connect(persistence: SettingsPersistence, workarounds: Workarounds) -> Result<Self> {
        let conn_display = Display::open(None)?;
        info!(
            screen = conn_display.screen_num,
            randr = %format!("{}.{}", conn_display.randr_version.0, conn_display.randr_version.1),
            persistence = %persistence.path().display(),
            hdr_blank_delay = ?workarounds.hdr_blank_delay,
            "Connected to X server"
        );
        Ok(Self {
            display_name: None,
            display: Some(conn_display),
            persistence,
            workarounds,
        })
    }

    /// The current connection, reopened if the previous one was lost
    fn connected<'a>(display: &'a mut Option<Display>, name: Option<&str>) -> Result<&'a Display> {
        if display.is_none() {
            let reopened = Display::open(name).context("Failed to reconnect to the X server")?;
            info!(screen = reopened.screen_num, "Reconnected to X server");
            *display = Some(reopened);
        }
        display.as_ref().context("No X server connection")
    }

    /// Map a failed call to its result, dropping the connection on transport failures
    fn failure(&mut self, error: &anyhow::Error) -> ApplyResult {
        let result = failure_result(error);
        if result == ApplyResult::ApiTemporarilyUnavailable && self.display.take().is_some() {
            warn!("Lost connection to the X server, reconnecting on next use");
        }
        result
    }

    fn read_topology(&mut self) -> Result<Topology> {
        Self::connected(&mut self.display, self.display_name.as_deref())?.read_topology()
    }

    fn try_apply(&mut self, config: &SingleDisplayConfiguration) -> Result<ApplyResult> {
        let display = Self::connected(&mut self.display, self.display_name.as_deref())?;
        let topology = display.read_topology()?;
        let Some(output) = topology.find_output(&config.device_id) else {
            error!(device = %config.device_id, "Display device not found or not connected");
            return Ok(ApplyResult::PermanentFailure);
        };

        if config.device_prep == DevicePreparation::VerifyOnly && output.crtc == 0 {
            error!(device = %output.name, "Display device is not active");
            return Ok(ApplyResult::PermanentFailure);
        }

        // Keep the state from before the first change, not the one before this change
        match self.persistence.load::<TopologySnapshot>() {
            Ok(Some(_)) => debug!("Keeping previously saved display state"),
            Ok(None) => {
                if let Err(e) = self.persistence.store(&topology.snapshot()) {
                    error!(error = %format!("{e:#}"), "Cannot save display state, refusing to change it");
                    return Ok(ApplyResult::PermanentFailure);
                }
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Saved display state is unreadable, refusing to change it");
                return Ok(ApplyResult::PermanentFailure);
            }
        }

        let Some(plan) = topology.apply_plan(output, config) else {
            return Ok(ApplyResult::PermanentFailure);
        };

        if let Some(hdr) = config.hdr_state {
            warn!(
                device = %output.name,
                hdr = ?hdr,
                hdr_blank_delay = ?self.workarounds.hdr_blank_delay,
                "HDR is not controllable through RandR, leaving it unchanged"
            );
        }

        let result = display.execute_plan(&topology, &plan)?;
        if result == ApplyResult::Ok {
            info!(
                device = %output.name,
                changes = plan.changes.len(),
                primary_changed = plan.primary.is_some(),
                "Applied display configuration"
            );
        }
        Ok(result)
    }
}

/// `None` on success
fn status_result(status: SetConfig) -> Option<ApplyResult> {
    if status == SetConfig::SUCCESS {
        None
    } else if status == SetConfig::INVALID_CONFIG_TIME || status == SetConfig::INVALID_TIME {
        // Configuration changed under us; a fresh read will succeed
        Some(ApplyResult::ApiTemporarilyUnavailable)
    } else {
        Some(ApplyResult::PermanentFailure)
    }
}

/// Transport failures are temporary; the server rejecting a request is not
fn failure_result(error: &anyhow::Error) -> ApplyResult {
    let transport = error.chain().any(|cause| {
        cause.is::<ConnectionError>()
            || cause.is::<ConnectError>()
            || matches!(cause.downcast_ref::<ReplyError>(), Some(ReplyError::ConnectionError(_)))
    });
    if transport {
        ApplyResult::ApiTemporarilyUnavailable
    } else {
        ApplyResult::PermanentFailure
    }
}

impl SettingsManager for X11SettingsManager {
    fn enumerate_available_devices(&mut self) -> Vec<EnumeratedDevice> {
        match self.read_topology() {
            Ok(topology) => topology.devices(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to enumerate display devices");
                self.failure(&e);
                Vec::new()
            }
        }
    }

    fn resolve_display_name(&mut self, device_id: &str) -> String {
        match self.read_topology() {
            Ok(topology) => topology
                .find_output(device_id)
                .map(|o| o.name.clone())
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), device = %device_id, "Failed to resolve display name");
                self.failure(&e);
                String::new()
            }
        }
    }

    fn apply(&mut self, config: &SingleDisplayConfiguration) -> ApplyResult {
        match self.try_apply(config) {
            Ok(result) => result,
            Err(e) => {
                let result = self.failure(&e);
                if result == ApplyResult::ApiTemporarilyUnavailable {
                    warn!(error = %format!("{e:#}"), "Display API unavailable");
                } else {
                    error!(error = %format!("{e:#}"), "X server rejected the display configuration");
                }
                result
            }
        }
    }

    fn revert(&mut self) -> bool {
        let snapshot = match self.persistence.load::<TopologySnapshot>() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!("No saved display state, nothing to revert");
                return true;
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to load saved display state");
                return false;
            }
        };

        let restored = Self::connected(&mut self.display, self.display_name.as_deref())
            .and_then(|display| display.restore(&snapshot));
        match restored {
            Ok(true) => match self.persistence.clear() {
                Ok(()) => {
                    info!("Reverted display configuration");
                    true
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Reverted display configuration but failed to clear saved state");
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to revert display configuration");
                self.failure(&e);
                false
            }
        }
    }

    fn reset_persistence(&mut self) -> bool {
        self.persistence
            .clear()
            .inspect_err(|e| error!(error = %format!("{e:#}"), "Failed to reset persisted display state"))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::ErrorKind;
    use x11rb::x11_utils::X11Error;

    const HDMI: randr::Output = 10;
    const DP: randr::Output = 11;
    const VGA: randr::Output = 12;
    const CRTC_A: randr::Crtc = 100;
    const CRTC_B: randr::Crtc = 101;

    fn mode(id: randr::Mode, width: u16, height: u16, refresh_mhz: u32) -> ModeEntry {
        ModeEntry {
            id,
            width,
            height,
            refresh_mhz,
        }
    }

    /// HDMI active and primary at 1920x1080@60 on CRTC A, DP connected but off, VGA unplugged
    fn fixture() -> Topology {
        Topology {
            config_timestamp: 1,
            modes: vec![
                mode(1, 1920, 1080, 60_000),
                mode(2, 1920, 1080, 144_000),
                mode(3, 2560, 1440, 59_951),
                mode(4, 2560, 1440, 120_000),
                mode(5, 1280, 720, 60_000),
            ],
            outputs: vec![
                OutputState {
                    id: HDMI,
                    name: "HDMI-1".to_string(),
                    connected: true,
                    crtc: CRTC_A,
                    crtcs: vec![CRTC_A, CRTC_B],
                    modes: vec![1, 2, 5],
                },
                OutputState {
                    id: DP,
                    name: "DP-1".to_string(),
                    connected: true,
                    crtc: 0,
                    crtcs: vec![CRTC_A, CRTC_B],
                    modes: vec![4, 3, 1, 5],
                },
                OutputState {
                    id: VGA,
                    name: "VGA-1".to_string(),
                    connected: false,
                    crtc: 0,
                    crtcs: vec![CRTC_B],
                    modes: vec![],
                },
            ],
            crtcs: vec![
                CrtcState {
                    id: CRTC_A,
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                    mode: 1,
                    rotation: ROTATE_0,
                    outputs: vec![HDMI],
                },
                CrtcState {
                    id: CRTC_B,
                    x: 0,
                    y: 0,
                    width: 0,
                    height: 0,
                    mode: 0,
                    rotation: ROTATE_0,
                    outputs: vec![],
                },
            ],
            primary: HDMI,
            screen: (1920, 1080),
            screen_max: (8192, 8192),
        }
    }

    fn output<'a>(topology: &'a Topology, name: &str) -> &'a OutputState {
        topology.find_output(name).unwrap()
    }

    #[test]
    fn test_refresh_mhz_from_timings() {
        // CEA 1080p60: 148.5 MHz, 2200 x 1125 total
        assert_eq!(refresh_mhz(148_500_000, 2200, 1125), 60_000);
        assert_eq!(refresh_mhz(148_500_000, 0, 1125), 0);
    }

    #[test]
    fn test_find_output() {
        let topology = fixture();
        assert_eq!(topology.find_output("").map(|o| o.id), Some(HDMI));
        assert_eq!(topology.find_output("dp-1").map(|o| o.id), Some(DP));
        // Disconnected outputs are not addressable
        assert!(topology.find_output("VGA-1").is_none());
        assert!(topology.find_output("eDP-1").is_none());
    }

    #[test]
    fn test_find_output_without_primary_uses_active() {
        let mut topology = fixture();
        topology.primary = 0;
        assert_eq!(topology.find_output("").map(|o| o.id), Some(HDMI));
    }

    #[test]
    fn test_select_mode_closest_refresh_within_tolerance() {
        let topology = fixture();
        let dp = output(&topology, "DP-1");

        let mode = topology.select_mode(dp, 2560, 1440, Some(59_940)).unwrap();
        assert_eq!(mode.id, 3);

        assert!(topology.select_mode(dp, 2560, 1440, Some(75_000)).is_none());
        assert!(topology.select_mode(dp, 3840, 2160, None).is_none());
        // Fastest mode without a target
        assert_eq!(topology.select_mode(dp, 2560, 1440, None).unwrap().id, 4);
    }

    #[test]
    fn test_devices() {
        let devices = fixture().devices();
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].device_id, "HDMI-1");
        assert!(devices[0].active);
        assert!(devices[0].primary);
        assert_eq!(devices[0].resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(devices[0].refresh_rate, Some(Rational::new(60_000, 1000)));

        assert_eq!(devices[1].device_id, "DP-1");
        assert!(!devices[1].active);
        assert_eq!(devices[1].resolution, None);
    }

    #[test]
    fn test_plan_refresh_change_keeps_position() {
        let topology = fixture();
        let mut config = SingleDisplayConfiguration::new("HDMI-1", DevicePreparation::VerifyOnly);
        config.refresh_rate = Some(Rational::new(144, 1));

        let plan = topology.apply_plan(output(&topology, "HDMI-1"), &config).unwrap();
        assert_eq!(plan.primary, None);
        assert_eq!(plan.screen, (1920, 1080));
        assert_eq!(
            plan.changes,
            vec![CrtcChange {
                crtc: CRTC_A,
                x: 0,
                y: 0,
                mode: 2,
                width: 1920,
                height: 1080,
                rotation: ROTATE_0,
                outputs: vec![HDMI],
            }]
        );
    }

    #[test]
    fn test_plan_unchanged_configuration_is_empty() {
        let topology = fixture();
        let config = SingleDisplayConfiguration::new("HDMI-1", DevicePreparation::EnsurePrimary);

        let plan = topology.apply_plan(output(&topology, "HDMI-1"), &config).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.primary, None);
    }

    #[test]
    fn test_plan_ensure_active_appends_to_the_right() {
        let topology = fixture();
        let mut config = SingleDisplayConfiguration::new("DP-1", DevicePreparation::EnsureActive);
        config.resolution = Some(Resolution::new(2560, 1440));
        config.refresh_rate = Some(Rational::new(120, 1));

        let plan = topology.apply_plan(output(&topology, "DP-1"), &config).unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].crtc, CRTC_B);
        assert_eq!(plan.changes[0].x, 1920);
        assert_eq!(plan.changes[0].mode, 4);
        assert_eq!(plan.changes[0].outputs, vec![DP]);
        assert_eq!(plan.screen, (1920 + 2560, 1440));
        assert_eq!(plan.primary, None);
    }

    #[test]
    fn test_plan_only_display_disables_others() {
        let topology = fixture();
        let config = SingleDisplayConfiguration::new("DP-1", DevicePreparation::EnsureOnlyDisplay);

        let plan = topology.apply_plan(output(&topology, "DP-1"), &config).unwrap();
        assert_eq!(plan.changes[0], CrtcChange::disable(CRTC_A));
        assert_eq!(plan.changes[1].crtc, CRTC_B);
        assert_eq!((plan.changes[1].x, plan.changes[1].y), (0, 0));
        // Preferred mode, as the output was off
        assert_eq!(plan.changes[1].mode, 4);
        assert_eq!(plan.screen, (2560, 1440));
        assert_eq!(plan.primary, Some(DP));
    }

    #[test]
    fn test_plan_verify_only_rejects_missing_mode() {
        let topology = fixture();
        let mut config = SingleDisplayConfiguration::new("HDMI-1", DevicePreparation::VerifyOnly);
        config.resolution = Some(Resolution::new(640, 480));

        assert!(topology.apply_plan(output(&topology, "HDMI-1"), &config).is_none());
    }

    #[test]
    fn test_plan_rejects_resolution_beyond_u16() {
        let topology = fixture();
        let mut config = SingleDisplayConfiguration::new("HDMI-1", DevicePreparation::VerifyOnly);
        config.resolution = Some(Resolution::new(70_000, 1080));

        assert!(topology.apply_plan(output(&topology, "HDMI-1"), &config).is_none());
    }

    #[test]
    fn test_snapshot_of_current_state_restores_to_nothing() {
        let topology = fixture();
        let snapshot = topology.snapshot();

        assert_eq!(snapshot.primary.as_deref(), Some("HDMI-1"));
        assert_eq!(
            snapshot.crtcs,
            vec![CrtcLayout {
                outputs: vec!["HDMI-1".to_string()],
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
                refresh_mhz: 60_000,
                rotation: ROTATE_0,
            }]
        );

        let plan = topology.restore_plan(&snapshot).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.primary, None);
    }

    #[test]
    fn test_restore_after_only_display() {
        let original = fixture();
        let snapshot = original.snapshot();

        // State after EnsureOnlyDisplay on DP-1
        let mut changed = fixture();
        changed.outputs[0].crtc = 0;
        changed.outputs[1].crtc = CRTC_B;
        changed.crtcs[0] = CrtcState {
            id: CRTC_A,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            mode: 0,
            rotation: ROTATE_0,
            outputs: vec![],
        };
        changed.crtcs[1] = CrtcState {
            id: CRTC_B,
            x: 0,
            y: 0,
            width: 2560,
            height: 1440,
            mode: 4,
            rotation: ROTATE_0,
            outputs: vec![DP],
        };
        changed.primary = DP;
        changed.screen = (2560, 1440);

        let plan = changed.restore_plan(&snapshot).unwrap();
        assert_eq!(plan.changes[0], CrtcChange::disable(CRTC_B));
        assert_eq!(plan.changes[1].crtc, CRTC_A);
        assert_eq!(plan.changes[1].mode, 1);
        assert_eq!(plan.changes[1].outputs, vec![HDMI]);
        assert_eq!(plan.screen, (1920, 1080));
        assert_eq!(plan.primary, Some(HDMI));
    }

    #[test]
    fn test_restore_with_missing_output_is_deferred() {
        let topology = fixture();
        let snapshot = TopologySnapshot {
            primary: Some("VGA-1".to_string()),
            crtcs: vec![CrtcLayout {
                outputs: vec!["VGA-1".to_string()],
                x: 0,
                y: 0,
                width: 1024,
                height: 768,
                refresh_mhz: 60_000,
                rotation: ROTATE_0,
            }],
        };

        assert!(topology.restore_plan(&snapshot).is_none());
    }

    #[test]
    fn test_rotated_crtc_area() {
        assert_eq!(oriented(1920, 1080, ROTATE_0), (1920, 1080));
        assert_eq!(oriented(1920, 1080, 2), (1080, 1920));
        assert_eq!(oriented(1920, 1080, 4), (1920, 1080));
    }

    #[test]
    fn test_status_result() {
        assert_eq!(status_result(SetConfig::SUCCESS), None);
        assert_eq!(
            status_result(SetConfig::INVALID_CONFIG_TIME),
            Some(ApplyResult::ApiTemporarilyUnavailable)
        );
        assert_eq!(status_result(SetConfig::FAILED), Some(ApplyResult::PermanentFailure));
    }

    #[test]
    fn test_plan_rejects_screen_beyond_maximum() {
        let mut topology = fixture();
        topology.screen_max = (4096, 4096);
        let dp = output(&topology, "DP-1").clone();

        // 1920 + 2560 side by side does not fit
        let mut config = SingleDisplayConfiguration::new("DP-1", DevicePreparation::EnsureActive);
        config.resolution = Some(Resolution::new(2560, 1440));
        assert!(topology.apply_plan(&dp, &config).is_none());

        // Alone at the origin it does
        config.device_prep = DevicePreparation::EnsureOnlyDisplay;
        let plan = topology.apply_plan(&dp, &config).unwrap();
        assert_eq!(plan.screen, (2560, 1440));
    }

    #[test]
    fn test_failure_classification() {
        let rejected = X11Error {
            error_kind: ErrorKind::Value,
            error_code: 2,
            sequence: 42,
            bad_value: 10240,
            minor_opcode: 7,
            major_opcode: 140,
            extension_name: Some("RANDR".to_string()),
            request_name: Some("SetScreenSize"),
        };
        let error = anyhow::Error::new(ReplyError::X11Error(rejected)).context("RandR SetScreenSize failed");
        assert_eq!(failure_result(&error), ApplyResult::PermanentFailure);

        let lost = anyhow::Error::new(ReplyError::ConnectionError(ConnectionError::UnknownError))
            .context("RandR GetCrtcInfo failed for CRTC 100");
        assert_eq!(failure_result(&lost), ApplyResult::ApiTemporarilyUnavailable);

        let broken_pipe = anyhow::Error::new(ConnectionError::IoError(std::io::ErrorKind::BrokenPipe.into()));
        assert_eq!(failure_result(&broken_pipe), ApplyResult::ApiTemporarilyUnavailable);

        let refused = anyhow::Error::new(ConnectError::InvalidScreen)
            .context("Failed to connect to the X server")
            .context("Failed to reconnect to the X server");
        assert_eq!(failure_result(&refused), ApplyResult::ApiTemporarilyUnavailable);

        assert_eq!(failure_result(&anyhow!("RandR extension is not available")), ApplyResult::PermanentFailure);
    }

    /// Manager whose connection was lost, pointing at a display nobody serves
    fn disconnected(dir: &tempfile::TempDir) -> X11SettingsManager {
        X11SettingsManager {
            display_name: Some(":4095".to_string()),
            display: None,
            persistence: SettingsPersistence::new(dir.path().join("display-state.json")),
            workarounds: Workarounds::default(),
        }
    }

    #[test]
    fn test_lost_connection_is_retried_with_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = disconnected(&dir);

        let config = SingleDisplayConfiguration::new("HDMI-1", DevicePreparation::EnsureActive);
        assert_eq!(manager.apply(&config), ApplyResult::ApiTemporarilyUnavailable);
        assert!(manager.display.is_none());
        assert!(manager.enumerate_available_devices().is_empty());
        assert_eq!(manager.resolve_display_name(""), "");

        // Nothing saved: no server needed
        assert!(manager.revert());

        // Saved state survives until a reconnect succeeds
        manager.persistence.store(&fixture().snapshot()).unwrap();
        assert!(!manager.revert());
        assert!(manager.persistence.load::<TopologySnapshot>().unwrap().is_some());
    }
}
