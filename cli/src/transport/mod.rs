//! Exclusive link to the device.
//!
//! The device runs a line-oriented interpreter behind a single channel that
//! cannot multiplex. Everything here is built around that constraint:
//!
//! - [`Transport`] - the request/response contract a link implements
//! - [`Link`] - single-slot ownership of a transport; one exchange at a time
//! - [`MemoryDevice`] - in-process device for `--device sim` and tests
//! - [`ReplTransport`] - raw-REPL client over TCP or any async byte stream
//! - [`AnyTransport`] - runtime selection between the two

mod link;
mod memory;
mod repl;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::sync::FileKind;

pub use link::{Link, LinkGuard};
pub use memory::{MemoryDevice, Request};
pub use repl::{LinkStream, ReplTransport};

/// Coarse connection state surfaced to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Firmware is being flashed; sync is not allowed.
    UpdatingFirmware,
}

impl ConnectionState {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::UpdatingFirmware => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::UpdatingFirmware,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::UpdatingFirmware => write!(f, "updating firmware"),
        }
    }
}

/// Acknowledgment of a mutating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Device tree revision after the mutation.
    pub revision: u64,
}

/// Structural device-side commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Create a directory; succeeds if it already exists.
    Mkdir { path: String },
    /// Remove a file, or a directory recursively.
    Remove { path: String },
    /// Move an entry.
    Rename { from: String, to: String },
}

/// One entry of a full device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
}

/// Full listing of the device tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub revision: u64,
    pub entries: Vec<DeviceEntry>,
}

/// Link and device errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Device did not answer within {0:?}")]
    Timeout(Duration),

    /// The interpreter reported an error.
    #[error("Device error: {0}")]
    Device(String),

    /// Unexpected bytes on the link.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not supported by this transport: {0}")]
    Unsupported(&'static str),

    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the link is gone, not just this request.
    #[must_use]
    pub const fn implies_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected(_) | Self::Io(_))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Request/response contract of a device link.
///
/// Implementations are driven by one caller at a time through [`Link`];
/// they never need internal locking for exclusivity.
pub trait Transport: Send + 'static {
    /// Open the link.
    fn connect(&mut self) -> impl Future<Output = TransportResult<()>> + Send;

    /// Close the link. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Coarse connection state.
    fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Whether [`DeviceCommand::Rename`] is available.
    fn supports_rename(&self) -> bool {
        false
    }

    /// Write a whole file.
    fn send_file(&mut self, path: &str, content: &[u8]) -> impl Future<Output = TransportResult<Ack>> + Send;

    /// Run a structural command.
    fn send_command(&mut self, command: &DeviceCommand) -> impl Future<Output = TransportResult<Ack>> + Send;

    /// Execute raw interpreter input and return its output.
    fn send_raw(&mut self, code: &[u8]) -> impl Future<Output = TransportResult<String>> + Send;

    /// Read a whole file.
    fn read_file(&mut self, path: &str) -> impl Future<Output = TransportResult<Vec<u8>>> + Send;

    /// Current device tree revision.
    fn tree_revision(&mut self) -> impl Future<Output = TransportResult<u64>> + Send;

    /// List the whole device tree.
    fn list_tree(&mut self) -> impl Future<Output = TransportResult<DeviceSnapshot>> + Send;
}

/// Runtime-selected transport for the CLI.
pub enum AnyTransport {
    Memory(MemoryDevice),
    Repl(ReplTransport),
}

impl Transport for AnyTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        match self {
            Self::Memory(t) => t.connect().await,
            Self::Repl(t) => t.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::Memory(t) => t.disconnect().await,
            Self::Repl(t) => t.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Memory(t) => t.is_connected(),
            Self::Repl(t) => t.is_connected(),
        }
    }

    fn state(&self) -> ConnectionState {
        match self {
            Self::Memory(t) => t.state(),
            Self::Repl(t) => t.state(),
        }
    }

    fn supports_rename(&self) -> bool {
        match self {
            Self::Memory(t) => t.supports_rename(),
            Self::Repl(t) => t.supports_rename(),
        }
    }

    async fn send_file(&mut self, path: &str, content: &[u8]) -> TransportResult<Ack> {
        match self {
            Self::Memory(t) => t.send_file(path, content).await,
            Self::Repl(t) => t.send_file(path, content).await,
        }
    }

    async fn send_command(&mut self, command: &DeviceCommand) -> TransportResult<Ack> {
        match self {
            Self::Memory(t) => t.send_command(command).await,
            Self::Repl(t) => t.send_command(command).await,
        }
    }

    async fn send_raw(&mut self, code: &[u8]) -> TransportResult<String> {
        match self {
            Self::Memory(t) => t.send_raw(code).await,
            Self::Repl(t) => t.send_raw(code).await,
        }
    }

    async fn read_file(&mut self, path: &str) -> TransportResult<Vec<u8>> {
        match self {
            Self::Memory(t) => t.read_file(path).await,
            Self::Repl(t) => t.read_file(path).await,
        }
    }

    async fn tree_revision(&mut self) -> TransportResult<u64> {
        match self {
            Self::Memory(t) => t.tree_revision().await,
            Self::Repl(t) => t.tree_revision().await,
        }
    }

    async fn list_tree(&mut self) -> TransportResult<DeviceSnapshot> {
        match self {
            Self::Memory(t) => t.list_tree().await,
            Self::Repl(t) => t.list_tree().await,
        }
    }
}
