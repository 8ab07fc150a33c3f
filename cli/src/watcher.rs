//! Local change source for the sync folder.
//!
//! Wraps a recursive `notify` watcher and translates its raw events into
//! [`LocalChange`]s for the engine. The notify callback runs on the watcher's
//! own thread; it only maps and pushes onto the engine's unbounded channel,
//! so it never waits on the device.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sync::{ChangeSender, LocalChange};

/// Map one raw notify event to zero or more local changes.
#[must_use]
pub fn changes_from_event(event: &Event) -> Vec<LocalChange> {
    let paths = &event.paths;
    match event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(LocalChange::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(LocalChange::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => renamed(mode, paths),
        EventKind::Modify(_) => paths.iter().cloned().map(LocalChange::Changed).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn renamed(mode: RenameMode, paths: &[PathBuf]) -> Vec<LocalChange> {
    match (mode, paths) {
        (RenameMode::Both, [from, to]) => vec![LocalChange::Renamed {
            from: from.clone(),
            to: to.clone(),
        }],
        (RenameMode::From, _) => paths.iter().cloned().map(LocalChange::Deleted).collect(),
        (RenameMode::To, _) => paths.iter().cloned().map(LocalChange::Created).collect(),
        // Direction unknown: whatever still exists was the destination.
        _ => paths
            .iter()
            .map(|path| {
                if path.exists() {
                    LocalChange::Created(path.clone())
                } else {
                    LocalChange::Deleted(path.clone())
                }
            })
            .collect(),
    }
}

/// Recursive watcher over one sync root. Dropping it stops watching.
pub struct LocalWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl LocalWatcher {
    /// Start watching `root`, forwarding changes to `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform watcher cannot be created or the
    /// root cannot be watched.
    pub fn start(root: &Path, sender: ChangeSender) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in changes_from_event(&event) {
                    debug!(?change, "Local change");
                    if !sender.send(change) {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "Watching");

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_basic_kinds() {
        let created = event(EventKind::Create(CreateKind::File), &["/r/a.py"]);
        assert_eq!(changes_from_event(&created), vec![LocalChange::Created("/r/a.py".into())]);

        let changed = event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/r/a.py"]);
        assert_eq!(changes_from_event(&changed), vec![LocalChange::Changed("/r/a.py".into())]);

        let removed = event(EventKind::Remove(RemoveKind::File), &["/r/a.py"]);
        assert_eq!(changes_from_event(&removed), vec![LocalChange::Deleted("/r/a.py".into())]);
    }

    #[test]
    fn test_rename_both_paths() {
        let ev = event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/r/old.py", "/r/new.py"]);
        assert_eq!(
            changes_from_event(&ev),
            vec![LocalChange::Renamed {
                from: "/r/old.py".into(),
                to: "/r/new.py".into()
            }]
        );
    }

    #[test]
    fn test_rename_halves() {
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/old.py"]);
        assert_eq!(changes_from_event(&from), vec![LocalChange::Deleted("/r/old.py".into())]);

        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/new.py"]);
        assert_eq!(changes_from_event(&to), vec![LocalChange::Created("/r/new.py".into())]);
    }

    #[test]
    fn test_access_is_ignored() {
        let ev = event(EventKind::Access(notify::event::AccessKind::Any), &["/r/a.py"]);
        assert!(changes_from_event(&ev).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        use crate::sync::{EngineConfig, SyncEngine, SyncRoot};
        use crate::transport::MemoryDevice;
        use std::time::Duration;

        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let device = MemoryDevice::new();
        let engine = SyncEngine::new(device.clone(), EngineConfig::default());
        engine.connect().await.unwrap();
        engine.start_sync(SyncRoot::new(&root)).await.unwrap();

        let watcher = LocalWatcher::start(&root, engine.change_sender()).unwrap();
        assert_eq!(watcher.root(), root.as_path());
        std::fs::write(root.join("main.py"), "print(1)").unwrap();

        let mut found = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.flush().await;
            if device.contains("main.py") {
                found = true;
                break;
            }
        }
        assert!(found, "watcher never delivered the new file");
        engine.shutdown().await;
    }
}
