//! In-memory mirror of the device file tree.
//!
//! The store is the single source of truth for browsing. It is only ever
//! mutated in two ways: [`DeviceFileStore::apply`] after the device
//! acknowledged an operation, and [`DeviceFileStore::replace_all`] after a
//! full listing. Nothing is written speculatively.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::sync::path;
use crate::sync::types::{DeviceFile, FileKind, OperationKind, PendingOperation};
use crate::transport::{Ack, DeviceSnapshot};

/// Store handle shared between the dispatcher and readers.
pub type SharedStore = Arc<RwLock<DeviceFileStore>>;

/// Mirror of the device tree keyed by device-relative path.
#[derive(Debug, Default)]
pub struct DeviceFileStore {
    entries: BTreeMap<String, DeviceFile>,
    revision: u64,
    /// Set by the first full listing.
    loaded: bool,
}

impl DeviceFileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new, empty store for sharing.
    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Tree revision, incremented on every successful apply.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, device_path: &str) -> Option<&DeviceFile> {
        self.entries.get(path::normalize(device_path))
    }

    #[must_use]
    pub fn contains(&self, device_path: &str) -> bool {
        self.get(device_path).is_some()
    }

    /// Direct children of a directory, sorted by path. `""` lists the root.
    #[must_use]
    pub fn list(&self, device_path: &str) -> Vec<&DeviceFile> {
        let dir = path::normalize(device_path);
        self.entries
            .values()
            .filter(|entry| path::parent(&entry.path) == Some(dir))
            .collect()
    }

    /// Every entry, sorted by path.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceFile> {
        self.entries.values()
    }

    /// Apply an acknowledged operation.
    ///
    /// Must only be called once the device confirmed `op`.
    pub fn apply(&mut self, op: &PendingOperation, ack: &Ack) {
        self.revision += 1;
        if ack.revision != self.revision {
            debug!(
                store = self.revision,
                device = ack.revision,
                "Device revision diverged from mirror"
            );
        }
        let revision = self.revision;
        let target = path::normalize(&op.device_path).to_string();

        match (op.kind, op.entry) {
            (OperationKind::Create | OperationKind::Update, FileKind::File) => {
                self.ensure_parents(&target, revision);
                let content = op.payload.clone().unwrap_or_default();
                self.entries
                    .insert(target.clone(), DeviceFile::file(target, content, revision));
            }
            (OperationKind::Create | OperationKind::Update, FileKind::Directory) => {
                self.ensure_parents(&target, revision);
                self.entries
                    .entry(target.clone())
                    .or_insert_with(|| DeviceFile::directory(target, revision));
            }
            (OperationKind::Delete, _) => {
                let removed = self.remove_subtree(&target);
                if removed.is_empty() {
                    debug!(path = %target, "Delete acknowledged for unknown entry");
                }
            }
            (OperationKind::Rename, _) => {
                let Some(from) = op.previous_device_path.as_deref().map(path::normalize) else {
                    warn!(op = %op, "Rename without a source path");
                    return;
                };
                self.rename_subtree(from, &target, revision);
            }
        }
    }

    /// Replace the whole mirror with a fresh listing.
    ///
    /// Cached content survives for files whose size is unchanged.
    pub fn replace_all(&mut self, snapshot: DeviceSnapshot) {
        let mut previous = std::mem::take(&mut self.entries);
        for entry in snapshot.entries {
            let key = path::normalize(&entry.path).to_string();
            let file = match entry.kind {
                FileKind::Directory => DeviceFile::directory(key.clone(), snapshot.revision),
                FileKind::File => match previous.remove(&key) {
                    Some(old) if old.kind == FileKind::File && old.size == entry.size => DeviceFile {
                        last_acked_revision: snapshot.revision,
                        ..old
                    },
                    _ => DeviceFile {
                        path: key.clone(),
                        kind: FileKind::File,
                        size: entry.size,
                        content: None,
                        content_hash: None,
                        last_acked_revision: snapshot.revision,
                    },
                },
            };
            self.entries.insert(key, file);
        }
        self.revision = snapshot.revision;
        self.loaded = true;
        debug!(revision = self.revision, entries = self.entries.len(), "Mirror rebuilt");
    }

    /// True if the mirror was never loaded or the device reports a
    /// revision it does not match.
    #[must_use]
    pub fn needs_refresh(&self, device_revision: u64) -> bool {
        !self.loaded || device_revision != self.revision
    }

    /// Whether a full listing has populated the mirror.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Record content read back from the device. Does not bump the revision.
    pub fn cache_content(&mut self, device_path: &str, content: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(path::normalize(device_path)) {
            entry.size = content.len() as u64;
            entry.content_hash = Some(crate::sync::hash::content_hash(&content));
            entry.content = Some(content);
        }
    }

    fn ensure_parents(&mut self, device_path: &str, revision: u64) {
        for ancestor in path::ancestors(device_path) {
            self.entries
                .entry(ancestor.to_string())
                .or_insert_with(|| DeviceFile::directory(ancestor, revision));
        }
    }

    fn subtree_keys(&self, root: &str) -> Vec<String> {
        self.entries
            .range(root.to_string()..)
            .take_while(|(key, _)| key.starts_with(root))
            .filter(|(key, _)| path::is_within(key, root))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn remove_subtree(&mut self, root: &str) -> Vec<DeviceFile> {
        self.subtree_keys(root)
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    fn rename_subtree(&mut self, from: &str, to: &str, revision: u64) {
        let moved = self.remove_subtree(from);
        if moved.is_empty() {
            warn!(from, to, "Rename acknowledged for unknown entry");
            return;
        }
        self.remove_subtree(to);
        self.ensure_parents(to, revision);
        for entry in moved {
            let suffix = &entry.path[from.len()..];
            let path = format!("{to}{suffix}");
            self.entries.insert(path.clone(), DeviceFile { path, ..entry });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceEntry;

    fn ack(revision: u64) -> Ack {
        Ack { revision }
    }

    fn write(store: &mut DeviceFileStore, path: &str, content: &[u8]) {
        let rev = store.revision() + 1;
        store.apply(
            &PendingOperation::create_file(format!("/r/{path}"), path, content.to_vec()),
            &ack(rev),
        );
    }

    #[test]
    fn test_apply_create_adds_parents() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "lib/ui/screen.py", b"x");

        assert_eq!(store.revision(), 1);
        assert!(store.get("lib").unwrap().is_dir());
        assert!(store.get("lib/ui").unwrap().is_dir());
        assert_eq!(store.get("lib/ui/screen.py").unwrap().size, 1);
    }

    #[test]
    fn test_list_direct_children_only() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "main.py", b"");
        write(&mut store, "lib/a.py", b"");
        write(&mut store, "lib/b.py", b"");

        let root: Vec<_> = store.list("").iter().map(|e| e.path.as_str()).collect();
        assert_eq!(root, vec!["lib", "main.py"]);

        let lib: Vec<_> = store.list("/lib/").iter().map(|e| e.name()).collect();
        assert_eq!(lib, vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_apply_delete_removes_subtree() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "lib/a.py", b"");
        write(&mut store, "library.py", b"");

        store.apply(&PendingOperation::delete("/r/lib", "lib", FileKind::Directory), &ack(3));

        assert!(!store.contains("lib"));
        assert!(!store.contains("lib/a.py"));
        assert!(store.contains("library.py"));
    }

    #[test]
    fn test_rename_preserves_content_and_revision() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "old.py", b"print(1)");
        let before = store.get("old.py").unwrap().clone();

        store.apply(&PendingOperation::rename("/r/new.py", "old.py", "new.py", FileKind::File), &ack(2));

        assert!(store.get("old.py").is_none());
        let after = store.get("new.py").unwrap();
        assert_eq!(after.content, before.content);
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(after.last_acked_revision, before.last_acked_revision);
    }

    #[test]
    fn test_rename_directory_moves_children() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "a/x.py", b"1");
        write(&mut store, "a/sub/y.py", b"2");

        store.apply(&PendingOperation::rename("/r/b", "a", "b", FileKind::Directory), &ack(3));

        assert!(store.iter().all(|e| !path::is_within(&e.path, "a")));
        assert!(store.get("b").unwrap().is_dir());
        assert_eq!(store.get("b/x.py").unwrap().content.as_deref(), Some(&b"1"[..]));
        assert!(store.contains("b/sub/y.py"));
    }

    #[test]
    fn test_replace_all_sets_revision() {
        let mut store = DeviceFileStore::new();
        write(&mut store, "stale.py", b"");

        store.replace_all(DeviceSnapshot {
            revision: 42,
            entries: vec![
                DeviceEntry { path: "lib".into(), kind: FileKind::Directory, size: 0 },
                DeviceEntry { path: "lib/a.py".into(), kind: FileKind::File, size: 7 },
            ],
        });

        assert_eq!(store.revision(), 42);
        assert!(!store.contains("stale.py"));
        assert_eq!(store.get("lib/a.py").unwrap().size, 7);
        assert!(store.get("lib/a.py").unwrap().content.is_none());
        assert!(!store.needs_refresh(42));
        assert!(store.needs_refresh(43));
    }

    #[test]
    fn test_unloaded_store_needs_refresh() {
        let store = DeviceFileStore::new();
        assert!(!store.is_loaded());
        assert!(store.needs_refresh(0));
    }

    #[test]
    fn test_cache_content_keeps_revision() {
        let mut store = DeviceFileStore::new();
        store.replace_all(DeviceSnapshot {
            revision: 5,
            entries: vec![DeviceEntry { path: "a.py".into(), kind: FileKind::File, size: 3 }],
        });

        store.cache_content("a.py", b"abc".to_vec());

        assert_eq!(store.revision(), 5);
        assert_eq!(store.get("a.py").unwrap().content.as_deref(), Some(&b"abc"[..]));
    }
}
