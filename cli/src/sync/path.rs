//! Translation between local filesystem paths and device-relative paths.
//!
//! Device paths are `/`-separated, relative to the device root, and never
//! carry the local sync root prefix: with a sync root of
//! `/proj/device-files`, the local file `/proj/device-files/lib/a.py` is the
//! device path `lib/a.py`. The root itself maps to the empty string.

use std::path::{Component, Path, PathBuf};

use crate::sync::types::{SyncError, SyncResult, SyncRoot};

fn invalid(path: impl Into<String>, reason: &'static str) -> SyncError {
    SyncError::InvalidPath {
        path: path.into(),
        reason,
    }
}

/// Translate an absolute local path into a device-relative path.
///
/// # Errors
///
/// Returns [`SyncError::InvalidPath`] if `local_path` is not under the sync
/// root, contains `..`, or is not valid UTF-8.
pub fn to_device_path(local_path: &Path, root: &SyncRoot) -> SyncResult<String> {
    let display = || local_path.display().to_string();
    let relative = local_path
        .strip_prefix(&root.local_root)
        .map_err(|_| invalid(display(), "outside the sync root"))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or_else(|| invalid(display(), "not valid UTF-8"))?);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(display(), "relative components are not allowed"));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Translate a device-relative path back to its local path.
///
/// Exact inverse of [`to_device_path`]. A leading `/` is tolerated.
///
/// # Errors
///
/// Returns [`SyncError::InvalidPath`] if the path contains `.` or `..`
/// segments.
pub fn to_local_path(device_path: &str, root: &SyncRoot) -> SyncResult<PathBuf> {
    let mut local = root.local_root.clone();
    for part in device_path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." {
            return Err(invalid(device_path, "relative components are not allowed"));
        }
        local.push(part);
    }
    Ok(local)
}

/// Strip leading and trailing slashes from a device path.
#[must_use]
pub fn normalize(device_path: &str) -> &str {
    device_path.trim_matches('/')
}

/// Parent directory of a device path (`""` for top-level entries).
#[must_use]
pub fn parent(device_path: &str) -> Option<&str> {
    let path = normalize(device_path);
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map_or("", |(dir, _)| dir))
}

/// True if `path` equals `ancestor` or lies below it.
#[must_use]
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let ancestor = normalize(ancestor);
    let path = normalize(path);
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Every proper ancestor of a device path, outermost first.
#[must_use]
pub fn ancestors(device_path: &str) -> Vec<&str> {
    let path = normalize(device_path);
    path.match_indices('/').map(|(i, _)| &path[..i]).collect()
}
