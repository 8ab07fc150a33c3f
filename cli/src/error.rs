//! Error types for the devsync CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (3=not_found, 4=validation, 5=device, etc.)
//! - Retryability flags for scripted callers
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::screen::ScreenError;
use crate::sync::SyncError;
use crate::transport::{ConnectionState, TransportError};

/// Result type alias for devsync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string or on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Not Found (exit 3)
    SyncFolderNotFound,
    DevicePathNotFound,
    NoActiveSession,

    // Validation (exit 4)
    InvalidArgument,
    InvalidPath,
    InvalidScreen,

    // Device (exit 5)
    DeviceUnreachable,
    DeviceTimeout,
    DeviceError,

    // Sync (exit 6)
    SyncDisallowed,
    SyncError,
    UploadIncomplete,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,
    WatchError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::SyncFolderNotFound => "SYNC_FOLDER_NOT_FOUND",
            Self::DevicePathNotFound => "DEVICE_PATH_NOT_FOUND",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InvalidPath => "INVALID_PATH",
            Self::InvalidScreen => "INVALID_SCREEN",
            Self::DeviceUnreachable => "DEVICE_UNREACHABLE",
            Self::DeviceTimeout => "DEVICE_TIMEOUT",
            Self::DeviceError => "DEVICE_ERROR",
            Self::SyncDisallowed => "SYNC_DISALLOWED",
            Self::SyncError => "SYNC_ERROR",
            Self::UploadIncomplete => "UPLOAD_INCOMPLETE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::WatchError => "WATCH_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::SyncFolderNotFound | Self::DevicePathNotFound | Self::NoActiveSession => 3,
            Self::InvalidArgument | Self::InvalidPath | Self::InvalidScreen => 4,
            Self::DeviceUnreachable | Self::DeviceTimeout | Self::DeviceError => 5,
            Self::SyncDisallowed | Self::SyncError | Self::UploadIncomplete => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError | Self::WatchError => 8,
        }
    }

    /// Whether retrying (possibly with corrected input) can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::InvalidPath
                | Self::InvalidScreen
                | Self::DeviceUnreachable
                | Self::DeviceTimeout
                | Self::SyncDisallowed
                | Self::UploadIncomplete
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in devsync CLI operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Sync folder not found: {}", path.display())]
    SyncFolderNotFound { path: PathBuf },

    #[error("No such device path: {path}")]
    DevicePathNotFound { path: String },

    #[error("Not a file on the device: {path}")]
    NotAFile { path: String },

    #[error("No active sync session")]
    NoActiveSession,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Sync is not allowed while the device is {state}")]
    SyncDisallowed { state: ConnectionState },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Screen(#[from] ScreenError),

    #[error("Upload incomplete: {failed} of {total} entries failed")]
    UploadIncomplete { failed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("No device configured")]
    NoDevice,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<SyncError> for Error {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            SyncError::NoActiveSession => Self::NoActiveSession,
            SyncError::SyncDisallowed { state } => Self::SyncDisallowed { state },
            SyncError::NotFound(path) => Self::DevicePathNotFound { path },
            SyncError::NotAFile(path) => Self::NotAFile { path },
            SyncError::Cancelled => Self::Cancelled,
            SyncError::Transport(e) => Self::Transport(e),
            SyncError::Io(e) => Self::Io(e),
        }
    }
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::SyncFolderNotFound { .. } => ErrorCode::SyncFolderNotFound,
            Self::DevicePathNotFound { .. } => ErrorCode::DevicePathNotFound,
            Self::NoActiveSession => ErrorCode::NoActiveSession,
            Self::InvalidArgument(_) | Self::NotAFile { .. } => ErrorCode::InvalidArgument,
            Self::InvalidPath { .. } => ErrorCode::InvalidPath,
            Self::Screen(ScreenError::Io(_)) => ErrorCode::IoError,
            Self::Screen(_) => ErrorCode::InvalidScreen,
            Self::Transport(TransportError::Timeout(_)) => ErrorCode::DeviceTimeout,
            Self::Transport(
                TransportError::NotConnected | TransportError::Disconnected(_) | TransportError::Io(_),
            ) => ErrorCode::DeviceUnreachable,
            Self::Transport(
                TransportError::Device(_) | TransportError::Protocol(_) | TransportError::Unsupported(_),
            ) => ErrorCode::DeviceError,
            Self::SyncDisallowed { .. } => ErrorCode::SyncDisallowed,
            Self::Cancelled => ErrorCode::SyncError,
            Self::UploadIncomplete { .. } => ErrorCode::UploadIncomplete,
            Self::NoDevice | Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Watch(_) => ErrorCode::WatchError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::SyncFolderNotFound { path } => Some(format!(
                "Create {} or run `devsync init` to scaffold a project.",
                path.display()
            )),

            Self::DevicePathNotFound { .. } => {
                Some("Use `devsync ls` to see what is on the device.".to_string())
            }

            Self::NotAFile { path } => Some(format!("Use `devsync ls {path}` to list a directory.")),

            Self::NoActiveSession => Some("Start one with `devsync sync`.".to_string()),

            Self::InvalidPath { .. } => Some(
                "Paths must live under the sync folder and must not contain `..`.".to_string(),
            ),

            Self::SyncDisallowed { .. } => {
                Some("Wait for the firmware update to finish, then retry.".to_string())
            }

            Self::Transport(TransportError::NotConnected | TransportError::Disconnected(_)) => Some(
                "Check the device address (`--device` or DEVSYNC_DEVICE), or use `--device sim`."
                    .to_string(),
            ),

            Self::Transport(TransportError::Timeout(_)) => Some(
                "The device stopped answering. Reset it, or raise `operation_timeout_ms` in config."
                    .to_string(),
            ),

            Self::UploadIncomplete { .. } => {
                Some("Re-run the upload; entries that succeeded are simply rewritten.".to_string())
            }

            Self::NoDevice => Some(
                "Pass --device host:port (or sim), set DEVSYNC_DEVICE, or add `device` to config.json."
                    .to_string(),
            ),

            Self::Config(_) => Some("Check ~/.devsync/config.json (or DEVSYNC_HOME).".to_string()),

            Self::Screen(_)
            | Self::InvalidArgument(_)
            | Self::Cancelled
            | Self::Transport(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Watch(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
