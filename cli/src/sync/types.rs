//! Core types for the device sync engine.
//!
//! This module defines the mirror entries, the sync root mapping, the queued
//! device operations and the local change notifications that feed them.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sync::path;
use crate::transport::TransportError;

/// Kind of a device filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// One entry of the in-memory device mirror.
///
/// `path` is device-relative (`lib/util.py`), never prefixed with the local
/// sync root and never starting with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFile {
    /// Device-relative path, unique within the store.
    pub path: String,
    /// File or directory.
    pub kind: FileKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Cached content, when known.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
    /// SHA256 of the acknowledged content.
    pub content_hash: Option<String>,
    /// Store revision at which the device last acknowledged this entry.
    pub last_acked_revision: u64,
}

impl DeviceFile {
    /// Build a file entry from acknowledged content.
    #[must_use]
    pub fn file(path: impl Into<String>, content: Vec<u8>, revision: u64) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::File,
            size: content.len() as u64,
            content_hash: Some(crate::sync::hash::content_hash(&content)),
            content: Some(content),
            last_acked_revision: revision,
        }
    }

    /// Build a directory entry.
    #[must_use]
    pub fn directory(path: impl Into<String>, revision: u64) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Directory,
            size: 0,
            content: None,
            content_hash: None,
            last_acked_revision: revision,
        }
    }

    /// Final path component.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Mapping of a local directory onto the device namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRoot {
    /// Absolute local directory mirrored onto the device root.
    pub local_root: PathBuf,
    /// Human-readable label for the device side of the mapping.
    pub mount_label: String,
}

impl SyncRoot {
    /// Create a sync root labelled after the local directory name.
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        let local_root = local_root.into();
        let mount_label = local_root
            .file_name()
            .map_or_else(|| "device".to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            local_root,
            mount_label,
        }
    }

    /// Override the device mount label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.mount_label = label.into();
        self
    }

    /// True if `path` lies at or below the local root (component-wise).
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.local_root)
    }
}

/// Kind of a queued device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Rename,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Rename => write!(f, "rename"),
        }
    }
}

/// A device-affecting action waiting in (or running from) the operation queue.
///
/// Identity is `(kind, device_path, seq)`; `seq` is assigned on submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Submission sequence number (0 until submitted).
    pub seq: u64,
    pub kind: OperationKind,
    /// Whether the target is a file or a directory.
    pub entry: FileKind,
    pub local_path: PathBuf,
    pub device_path: String,
    /// Source path of a rename.
    pub previous_device_path: Option<String>,
    /// File content for create/update of files.
    pub payload: Option<Vec<u8>>,
    /// Sync session generation that produced this operation.
    ///
    /// `None` means the operation is not bound to a session (bulk uploads
    /// and explicit commands issued outside an active sync).
    pub generation: Option<u64>,
}

impl PendingOperation {
    fn new(kind: OperationKind, entry: FileKind, local_path: PathBuf, device_path: String) -> Self {
        Self {
            seq: 0,
            kind,
            entry,
            local_path,
            device_path,
            previous_device_path: None,
            payload: None,
            generation: None,
        }
    }

    /// Create a file with the given content.
    pub fn create_file(local_path: impl Into<PathBuf>, device_path: impl Into<String>, content: Vec<u8>) -> Self {
        let mut op = Self::new(OperationKind::Create, FileKind::File, local_path.into(), device_path.into());
        op.payload = Some(content);
        op
    }

    /// Create a directory.
    pub fn create_dir(local_path: impl Into<PathBuf>, device_path: impl Into<String>) -> Self {
        Self::new(OperationKind::Create, FileKind::Directory, local_path.into(), device_path.into())
    }

    /// Replace the content of an existing file.
    pub fn update(local_path: impl Into<PathBuf>, device_path: impl Into<String>, content: Vec<u8>) -> Self {
        let mut op = Self::new(OperationKind::Update, FileKind::File, local_path.into(), device_path.into());
        op.payload = Some(content);
        op
    }

    /// Delete a file or directory (directories recursively).
    pub fn delete(local_path: impl Into<PathBuf>, device_path: impl Into<String>, entry: FileKind) -> Self {
        Self::new(OperationKind::Delete, entry, local_path.into(), device_path.into())
    }

    /// Rename `from` to `to` on the device.
    pub fn rename(
        local_path: impl Into<PathBuf>,
        from: impl Into<String>,
        to: impl Into<String>,
        entry: FileKind,
    ) -> Self {
        let mut op = Self::new(OperationKind::Rename, entry, local_path.into(), to.into());
        op.previous_device_path = Some(from.into());
        op
    }

    /// Bind the operation to a sync session generation.
    #[must_use]
    pub fn in_generation(mut self, generation: Option<u64>) -> Self {
        self.generation = generation;
        self
    }

    /// True if this operation writes file content that a newer write may replace.
    #[must_use]
    pub fn is_content_write(&self) -> bool {
        self.entry == FileKind::File && matches!(self.kind, OperationKind::Create | OperationKind::Update)
    }

    /// True if the operation reads or writes `device_path`, directly or by
    /// acting on one of its ancestor directories.
    #[must_use]
    pub fn touches(&self, device_path: &str) -> bool {
        path::is_within(device_path, &self.device_path)
            || self
                .previous_device_path
                .as_deref()
                .is_some_and(|from| path::is_within(device_path, from))
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.previous_device_path {
            Some(from) => write!(f, "#{} {} {} -> {}", self.seq, self.kind, from, self.device_path),
            None => write!(f, "#{} {} {}", self.seq, self.kind, self.device_path),
        }
    }
}

/// A change observed in the watched local directory.
///
/// Every path is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl LocalChange {
    /// Static mapping from notification kind to device operation kind.
    #[must_use]
    pub const fn operation_kind(&self) -> OperationKind {
        match self {
            Self::Created(_) => OperationKind::Create,
            Self::Changed(_) => OperationKind::Update,
            Self::Deleted(_) => OperationKind::Delete,
            Self::Renamed { .. } => OperationKind::Rename,
        }
    }
}

/// Final result of one queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledged by the device and applied to the mirror.
    Applied { revision: u64 },
    /// The device or the link reported an error.
    Failed(String),
    /// Dropped before it was sent (stop, disconnect, stale session).
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// One failed entry of a bulk upload.
#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    /// Device path (or local path when translation failed).
    pub path: String,
    pub reason: String,
}

/// Success/failure tally of a bulk upload.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkStats {
    /// Directories created on the device.
    pub directories: usize,
    /// Files written to the device.
    pub files: usize,
    /// Written files whose content already matched the mirror.
    pub unchanged: usize,
    /// Entries that failed.
    pub failed: usize,
    /// Details for each failed entry.
    pub failures: Vec<BulkFailure>,
}

impl BulkStats {
    /// Number of entries that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.directories + self.files
    }

    /// Total entries attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded() + self.failed
    }

    /// True if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub(crate) fn record_failure(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.failed += 1;
        self.failures.push(BulkFailure {
            path: path.into(),
            reason: reason.into(),
        });
    }
}

/// Sync engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A path could not be translated between the two namespaces.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// No sync session is active.
    #[error("No active sync session")]
    NoActiveSession,

    /// Sync cannot start in the current connection state.
    #[error("Sync is not allowed while the device is {state}")]
    SyncDisallowed { state: crate::transport::ConnectionState },

    /// Device path is absent from the mirror.
    #[error("No such device path: {0}")]
    NotFound(String),

    /// Device path is a directory where a file was expected.
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// The operation was dropped before it reached the device.
    #[error("Operation cancelled")]
    Cancelled,

    /// The device or the link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_file_name() {
        let file = DeviceFile::file("lib/util.py", b"x = 1".to_vec(), 3);
        assert_eq!(file.name(), "util.py");
        assert_eq!(file.size, 5);
        assert_eq!(file.last_acked_revision, 3);
        assert!(file.content_hash.is_some());

        let dir = DeviceFile::directory("lib", 1);
        assert!(dir.is_dir());
        assert_eq!(dir.name(), "lib");
    }

    #[test]
    fn test_sync_root_label_and_contains() {
        let root = SyncRoot::new("/proj/device-files");
        assert_eq!(root.mount_label, "device-files");
        assert!(root.contains(Path::new("/proj/device-files/a.py")));
        assert!(!root.contains(Path::new("/proj/device-files2/a.py")));
        assert!(!root.contains(Path::new("/proj/other/a.py")));
    }

    #[test]
    fn test_operation_kind_mapping() {
        let p = PathBuf::from("/r/a.py");
        assert_eq!(LocalChange::Created(p.clone()).operation_kind(), OperationKind::Create);
        assert_eq!(LocalChange::Changed(p.clone()).operation_kind(), OperationKind::Update);
        assert_eq!(LocalChange::Deleted(p.clone()).operation_kind(), OperationKind::Delete);
        assert_eq!(
            LocalChange::Renamed { from: p.clone(), to: p }.operation_kind(),
            OperationKind::Rename
        );
    }

    #[test]
    fn test_pending_operation_touches() {
        let op = PendingOperation::rename("/r/b.py", "a.py", "b.py", FileKind::File);
        assert!(op.touches("a.py"));
        assert!(op.touches("b.py"));
        assert!(!op.touches("c.py"));
        assert!(!op.is_content_write());

        let dir = PendingOperation::rename("/r/new", "old", "new", FileKind::Directory);
        assert!(dir.touches("old/a.py"));
        assert!(dir.touches("new/deep/b.py"));
        assert!(!dir.touches("older/a.py"));
        assert!(PendingOperation::update("/r/a.py", "a.py", vec![]).is_content_write());
    }

    #[test]
    fn test_bulk_stats() {
        let mut stats = BulkStats::default();
        assert!(stats.is_clean());
        stats.files = 3;
        stats.directories = 1;
        stats.record_failure("x.py", "device error");
        assert_eq!(stats.succeeded(), 4);
        assert_eq!(stats.total(), 5);
        assert!(!stats.is_clean());
    }
}
