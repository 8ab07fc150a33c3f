//! Persistent settings (`config.json`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::{atomic_write, EngineConfig};

/// Default name of the local folder mirrored onto the device.
pub const DEFAULT_SYNC_FOLDER: &str = "device-files";

/// User settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Device endpoint: `host:port` or `sim`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub sync_folder: String,
    pub operation_timeout_ms: u64,
    /// Overrides what the transport reports about native rename.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_rename: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: None,
            sync_folder: DEFAULT_SYNC_FOLDER.to_string(),
            operation_timeout_ms: 10_000,
            supports_rename: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Write settings to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json)?;
        Ok(())
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Engine configuration derived from these settings.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            operation_timeout: self.operation_timeout(),
            supports_rename: self.supports_rename,
        }
    }
}
