//! IPC (Inter-Process Communication) via Unix sockets
//!
//! Message-based control channel between the CLI and the display daemon.
//! Uses length-prefixed JSON over Unix domain sockets.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::ipc::{MAX_MESSAGE_SIZE, SOCKET_NAME};

mod messages;
pub use messages::{DaemonRequest, DaemonResponse};

/// Get default socket path (XDG_RUNTIME_DIR with fallback to cache)
pub fn default_socket_path() -> Result<PathBuf> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(runtime_dir).join(SOCKET_NAME));
    }

    let cache = dirs::cache_dir()
        .context("Failed to determine cache directory (no XDG_RUNTIME_DIR or HOME)")?;
    Ok(cache.join(SOCKET_NAME))
}

/// Client connection to the daemon
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    pub fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("Failed to connect to daemon at {}", path.display()))?;
        Ok(Self { stream })
    }

    /// Send request and wait for response
    pub fn request(&mut self, req: &DaemonRequest) -> Result<DaemonResponse> {
        write_message(&mut self.stream, req)?;
        read_message(&mut self.stream)
    }
}

/// Server side of one accepted connection
pub struct ServerConnection {
    stream: UnixStream,
}

impl ServerConnection {
    /// Receive request from the CLI (blocking)
    pub fn recv_request(&mut self) -> Result<DaemonRequest> {
        read_message(&mut self.stream)
    }

    pub fn send_response(&mut self, resp: &DaemonResponse) -> Result<()> {
        write_message(&mut self.stream, resp)
    }
}

/// Listening socket of the daemon
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl DaemonServer {
    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
        }

        // Remove stale socket if exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket at {}", socket_path.display()))?;

        // Owner only
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))
                .context("Failed to set socket permissions")?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept incoming connection (blocking)
    pub fn accept(&self) -> Result<ServerConnection> {
        let (stream, _addr) = self
            .listener
            .accept()
            .context("Failed to accept IPC connection")?;
        Ok(ServerConnection { stream })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if std::fs::remove_file(&self.socket_path).is_ok() {
            debug!(socket = %self.socket_path.display(), "Removed daemon socket");
        }
    }
}

/// Write length-prefixed message to stream
fn write_message<T: Serialize>(stream: &mut impl Write, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", json.len(), MAX_MESSAGE_SIZE));
    }

    // u32 little-endian length prefix; fits, since MAX_MESSAGE_SIZE < u32::MAX
    let len = json.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .context("Failed to write message length")?;
    stream
        .write_all(&json)
        .context("Failed to write message payload")?;
    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

/// Read length-prefixed message from stream
fn read_message<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check (prevent DoS via huge allocation)
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    serde_json::from_slice(&json_buf).context("Failed to deserialize message from JSON")
}
