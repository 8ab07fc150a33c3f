//! Bulk upload of a local subtree.
//!
//! The subtree is walked breadth-first. Missing directories are created
//! first, then every file is written, one queue submission at a time. A
//! failing entry is tallied and the upload moves on.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::sync::hash::{content_hash, has_changed};
use crate::sync::path::to_device_path;
use crate::sync::queue::OperationQueue;
use crate::sync::store::SharedStore;
use crate::sync::types::{BulkStats, FileKind, Outcome, PendingOperation, SyncResult, SyncRoot};

/// Result of a breadth-first walk.
#[derive(Debug, Default)]
pub(crate) struct Walk {
    /// Every readable entry, in visit order.
    pub entries: Vec<(PathBuf, FileKind)>,
    /// Directories or entries that could not be read, with the reason.
    pub unreadable: Vec<(PathBuf, String)>,
}

/// Enumerate a local tree breadth-first.
///
/// The starting directory itself is not included. Entries of one directory
/// are sorted by name; symlinks are skipped. A directory that cannot be read
/// is recorded in [`Walk::unreadable`] and the walk carries on with the rest.
pub(crate) async fn walk(start: &Path) -> Walk {
    let mut walk = Walk::default();
    let mut frontier = VecDeque::from([start.to_path_buf()]);

    while let Some(dir) = frontier.pop_front() {
        let mut level = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot read directory");
                walk.unreadable.push((dir, e.to_string()));
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Directory listing interrupted");
                    walk.unreadable.push((dir.clone(), e.to_string()));
                    break;
                }
            };
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => level.push((entry.path(), FileKind::Directory)),
                Ok(file_type) if file_type.is_file() => level.push((entry.path(), FileKind::File)),
                Ok(_) => {}
                Err(e) => walk.unreadable.push((entry.path(), e.to_string())),
            }
        }
        level.sort_by(|a, b| a.0.cmp(&b.0));
        frontier.extend(
            level
                .iter()
                .filter(|(_, kind)| *kind == FileKind::Directory)
                .map(|(path, _)| path.clone()),
        );
        walk.entries.extend(level);
    }

    walk
}

/// Device path for a failure report, falling back to the local path.
fn failure_path(local: &Path, root: &SyncRoot) -> String {
    to_device_path(local, root).unwrap_or_else(|_| local.to_string_lossy().into_owned())
}

/// Feeds a local subtree through the operation queue.
#[derive(Debug, Clone)]
pub struct BulkUploader {
    queue: OperationQueue,
    store: SharedStore,
}

impl BulkUploader {
    pub fn new(queue: OperationQueue, store: SharedStore) -> Self {
        Self { queue, store }
    }

    fn known(&self, device_path: &str, kind: FileKind) -> bool {
        self.store
            .read()
            .map(|store| store.get(device_path).is_some_and(|entry| entry.kind == kind))
            .unwrap_or(false)
    }

    fn mirrored_hash(&self, device_path: &str) -> Option<String> {
        self.store
            .read()
            .ok()
            .and_then(|store| store.get(device_path).and_then(|entry| entry.content_hash.clone()))
    }

    /// Upload `subtree` (a directory or a single file) under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error only if `subtree` is outside `root` or does not
    /// exist. Unreadable or untranslatable entries are reported in the stats
    /// and the rest of the tree is still uploaded.
    pub async fn upload(&self, root: &SyncRoot, subtree: &Path, generation: Option<u64>) -> SyncResult<BulkStats> {
        let base = to_device_path(subtree, root)?;
        let metadata = tokio::fs::metadata(subtree).await?;

        let mut stats = BulkStats::default();
        let mut directories = Vec::new();
        let mut files = Vec::new();
        if metadata.is_dir() {
            if !base.is_empty() {
                directories.push((subtree.to_path_buf(), base.clone()));
            }
            let walk = walk(subtree).await;
            for (local, reason) in walk.unreadable {
                stats.record_failure(failure_path(&local, root), reason);
            }
            for (local, kind) in walk.entries {
                let device = match to_device_path(&local, root) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!(path = %local.display(), error = %e, "Skipping entry");
                        stats.record_failure(local.to_string_lossy(), e.to_string());
                        continue;
                    }
                };
                match kind {
                    FileKind::Directory => directories.push((local, device)),
                    FileKind::File => files.push((local, device)),
                }
            }
        } else {
            files.push((subtree.to_path_buf(), base));
        }

        info!(
            subtree = %subtree.display(),
            directories = directories.len(),
            files = files.len(),
            "Uploading"
        );

        for (local, device) in directories {
            if self.known(&device, FileKind::Directory) {
                debug!(path = %device, "Directory already on device");
                continue;
            }
            let op = PendingOperation::create_dir(local, device.clone()).in_generation(generation);
            match self.queue.submit(op).wait().await {
                Outcome::Applied { .. } => stats.directories += 1,
                Outcome::Failed(reason) => {
                    warn!(path = %device, %reason, "Directory upload failed");
                    stats.record_failure(device, reason);
                }
                Outcome::Cancelled => stats.record_failure(device, "cancelled"),
            }
        }

        for (local, device) in files {
            let content = match tokio::fs::read(&local).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "Cannot read file");
                    stats.record_failure(device, e.to_string());
                    continue;
                }
            };
            let unchanged = !has_changed(&content_hash(&content), self.mirrored_hash(&device).as_deref());
            let op = if self.known(&device, FileKind::File) {
                PendingOperation::update(local, device.clone(), content)
            } else {
                PendingOperation::create_file(local, device.clone(), content)
            };
            match self.queue.submit(op.in_generation(generation)).wait().await {
                Outcome::Applied { .. } => {
                    stats.files += 1;
                    stats.unchanged += usize::from(unchanged);
                }
                Outcome::Failed(reason) => {
                    warn!(path = %device, %reason, "File upload failed");
                    stats.record_failure(device, reason);
                }
                Outcome::Cancelled => stats.record_failure(device, "cancelled"),
            }
        }

        info!(
            succeeded = stats.succeeded(),
            unchanged = stats.unchanged,
            failed = stats.failed,
            "Upload finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_walk_is_breadth_first_and_sorted() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("z.py"), "").unwrap();
        fs::write(root.join("a/x.py"), "").unwrap();
        fs::write(root.join("b/deep/y.py"), "").unwrap();

        let found: Vec<_> = walk(root)
            .await
            .entries
            .into_iter()
            .map(|(path, _)| path.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(found, vec!["a", "b", "z.py", "a/x.py", "b/deep", "b/deep/y.py"]);
    }

    #[tokio::test]
    async fn test_walk_reports_missing_directory() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone");

        let walk = walk(&missing).await;
        assert!(walk.entries.is_empty());
        assert_eq!(walk.unreadable.len(), 1);
        assert_eq!(walk.unreadable[0].0, missing);
    }
}
