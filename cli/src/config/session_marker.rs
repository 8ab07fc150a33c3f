//! Active-session marker.
//!
//! `devsync sync` writes a small JSON file while it runs so that other
//! invocations (`devsync status`) can tell a session is live, which root it
//! mirrors and which device it talks to. The file is written atomically with
//! owner-only permissions and removed when the session stops.
//!
//! A marker older than [`MARKER_TTL_HOURS`] is treated as left behind by a crashed
//! process and ignored (and removed on read).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::sync::ActiveSync;

/// Markers older than this many hours are stale.
pub const MARKER_TTL_HOURS: i64 = 12;

/// Contents of `active-session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMarker {
    pub session_id: String,
    pub sync_root: String,
    pub mount_label: String,
    pub device: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionMarker {
    /// Marker for a session started by this process.
    #[must_use]
    pub fn for_session(session: &ActiveSync, device: &str) -> Self {
        Self {
            session_id: session.id.to_string(),
            sync_root: session.root.local_root.display().to_string(),
            mount_label: session.root.mount_label.clone(),
            device: device.to_string(),
            pid: std::process::id(),
            started_at: session.started_at,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at) > Duration::hours(MARKER_TTL_HOURS)
    }
}

/// Location of the marker file.
#[must_use]
pub fn marker_path() -> Option<PathBuf> {
    super::devsync_home().map(|dir| dir.join("active-session.json"))
}

fn write_marker_at(path: &Path, marker: &SessionMarker) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let json = serde_json::to_string_pretty(marker)?;
    {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn read_marker_at(path: &Path, now: DateTime<Utc>) -> Option<SessionMarker> {
    let content = fs::read_to_string(path).ok()?;
    let marker: SessionMarker = serde_json::from_str(&content).ok()?;

    if marker.is_stale(now) {
        let _ = fs::remove_file(path);
        return None;
    }

    Some(marker)
}

/// Record the running session.
///
/// # Errors
///
/// Returns an error if the state directory cannot be written.
pub fn write_session_marker(marker: &SessionMarker) -> Result<()> {
    match marker_path() {
        Some(path) => write_marker_at(&path, marker),
        None => Ok(()),
    }
}

/// The live session marker, if any.
///
/// Returns `None` if the file is missing, corrupted or stale.
#[must_use]
pub fn read_session_marker() -> Option<SessionMarker> {
    read_marker_at(&marker_path()?, Utc::now())
}

/// Remove the marker. Returns `true` if no marker remains.
pub fn clear_session_marker() -> bool {
    let Some(path) = marker_path() else {
        return true;
    };
    match fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}
