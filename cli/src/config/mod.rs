//! Configuration management.
//!
//! This module discovers the project, resolves the device endpoint and the
//! sync folder, and locates devsync's own state directory.
//!
//! # Layout
//!
//! - **State dir**: `~/.devsync/` (override with `DEVSYNC_HOME`)
//! - **Settings**: `~/.devsync/config.json`
//! - **Session marker**: `~/.devsync/active-session.json`, present while
//!   `devsync sync` runs
//! - **Sync folder**: `<project>/device-files/` by default, the local mirror
//!   of the device's filesystem

mod session_marker;
mod settings;

pub use session_marker::{
    clear_session_marker, marker_path, read_session_marker, write_session_marker, SessionMarker,
};
pub use settings::{Settings, DEFAULT_SYNC_FOLDER};

use crate::error::{Error, Result};

use std::path::{Path, PathBuf};

/// Get devsync's state directory.
///
/// `DEVSYNC_HOME` wins when set; otherwise `~/.devsync/`.
#[must_use]
pub fn devsync_home() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("DEVSYNC_HOME") {
        if !home.trim().is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    directories::BaseDirs::new().map(|b| b.home_dir().join(".devsync"))
}

/// Path of the settings file.
#[must_use]
pub fn settings_path() -> Option<PathBuf> {
    devsync_home().map(|dir| dir.join("config.json"))
}

/// Load settings from the default location.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_settings() -> Result<Settings> {
    match settings_path() {
        Some(path) => Settings::load(&path),
        None => Ok(Settings::default()),
    }
}

/// Get the git repository root directory.
fn git_toplevel() -> Option<PathBuf> {
    std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// Nearest ancestor of `start` (inclusive) holding `sync_folder`.
fn find_upwards(start: &Path, sync_folder: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(sync_folder).is_dir())
        .map(Path::to_path_buf)
}

/// Discover the project root.
///
/// Resolution strategy:
/// 1. The **git root**, if it holds the sync folder. Keeps a stray
///    subdirectory folder from shadowing the real project.
/// 2. The nearest ancestor of the cwd holding the sync folder.
#[must_use]
pub fn discover_project_root(sync_folder: &str) -> Option<PathBuf> {
    if let Some(git_root) = git_toplevel() {
        if git_root.join(sync_folder).is_dir() {
            return Some(git_root);
        }
    }

    std::env::current_dir()
        .ok()
        .and_then(|cwd| find_upwards(&cwd, sync_folder))
}

/// Project root, falling back to the cwd when nothing is discovered.
///
/// # Errors
///
/// Returns an error if the cwd cannot be read.
pub fn current_project_root(sync_folder: &str) -> Result<PathBuf> {
    match discover_project_root(sync_folder) {
        Some(root) => Ok(root),
        None => Ok(std::env::current_dir()?),
    }
}

/// Resolve the device endpoint.
///
/// Priority:
/// 1. Explicit `--device` flag
/// 2. `DEVSYNC_DEVICE` environment variable
/// 3. `device` in the settings file
#[must_use]
pub fn resolve_device(explicit: Option<&str>, settings: &Settings) -> Option<String> {
    if let Some(device) = explicit {
        return Some(device.to_string());
    }

    if let Ok(device) = std::env::var("DEVSYNC_DEVICE") {
        if !device.trim().is_empty() {
            return Some(device);
        }
    }

    settings.device.clone()
}

/// Resolve the local sync root.
///
/// An explicit folder is taken relative to the cwd; otherwise the
/// configured sync folder under the discovered project root.
///
/// # Errors
///
/// Returns [`Error::SyncFolderNotFound`] if the folder is not a directory.
pub fn resolve_sync_root(explicit: Option<&Path>, settings: &Settings) -> Result<PathBuf> {
    let folder = match explicit {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => std::env::current_dir()?.join(path),
        None => current_project_root(&settings.sync_folder)?.join(&settings.sync_folder),
    };

    if !folder.is_dir() {
        return Err(Error::SyncFolderNotFound { path: folder });
    }

    // Canonical form keeps watcher paths and the root prefix comparable.
    Ok(folder.canonicalize().unwrap_or(folder))
}
