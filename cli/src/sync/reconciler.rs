//! Local change notifications to device operations.
//!
//! The reconciler only filters, translates and enqueues. It never waits on
//! the device, so the notification path cannot stall behind a slow link.

use std::path::Path;

use tracing::{debug, trace, warn};

use crate::sync::bulk::walk;
use crate::sync::path::to_device_path;
use crate::sync::queue::{OperationQueue, Ticket};
use crate::sync::session::ActiveSync;
use crate::sync::store::SharedStore;
use crate::sync::types::{FileKind, LocalChange, PendingOperation, SyncError, SyncRoot};

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// New queue entries were appended.
    Queued(usize),
    /// Folded into an already-queued write.
    Superseded,
    /// Outside the root, or nothing to do.
    Ignored,
    /// The path could not be translated.
    Rejected,
}

enum Local {
    Missing,
    Dir,
    File(Vec<u8>),
}

async fn inspect(path: &Path) -> Local {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Local::Dir,
        Ok(_) => match tokio::fs::read(path).await {
            Ok(content) => Local::File(content),
            Err(_) => Local::Missing,
        },
        Err(_) => Local::Missing,
    }
}

/// Translates [`LocalChange`]s scoped to the active root into queued operations.
#[derive(Debug, Clone)]
pub struct ChangeReconciler {
    queue: OperationQueue,
    store: SharedStore,
    supports_rename: bool,
}

impl ChangeReconciler {
    pub fn new(queue: OperationQueue, store: SharedStore, supports_rename: bool) -> Self {
        Self {
            queue,
            store,
            supports_rename,
        }
    }

    fn mirrored_kind(&self, device_path: &str) -> Option<FileKind> {
        self.store
            .read()
            .ok()
            .and_then(|store| store.get(device_path).map(|entry| entry.kind))
    }

    /// Handle one notification for the given session.
    pub async fn reconcile(&self, change: LocalChange, active: &ActiveSync) -> Dispatch {
        let root = &active.root;
        let generation = Some(active.generation);
        trace!(?change, "Local change");

        let mut batch = Batch::default();
        let result = match change {
            LocalChange::Created(path) => self.created(&path, root, generation, &mut batch).await,
            LocalChange::Changed(path) => self.changed(&path, root, generation, &mut batch).await,
            LocalChange::Deleted(path) => self.deleted(&path, root, generation, &mut batch),
            LocalChange::Renamed { from, to } => match (root.contains(&from), root.contains(&to)) {
                (true, true) => self.renamed(&from, &to, root, generation, &mut batch).await,
                (false, true) => self.created(&to, root, generation, &mut batch).await,
                (true, false) => self.deleted(&from, root, generation, &mut batch),
                (false, false) => Ok(()),
            },
        };

        match result {
            Err(SyncError::InvalidPath { path, reason }) => {
                warn!(%path, reason, "Dropping change with untranslatable path");
                Dispatch::Rejected
            }
            Err(e) => {
                warn!(error = %e, "Dropping change");
                Dispatch::Rejected
            }
            Ok(()) => batch.into_dispatch(),
        }
    }

    /// Translate `path`, or `None` when it is outside the root or the root itself.
    fn translate(path: &Path, root: &SyncRoot) -> Result<Option<String>, SyncError> {
        if !root.contains(path) {
            trace!(path = %path.display(), "Outside the sync root");
            return Ok(None);
        }
        let device = to_device_path(path, root)?;
        Ok((!device.is_empty()).then_some(device))
    }

    async fn created(
        &self,
        path: &Path,
        root: &SyncRoot,
        generation: Option<u64>,
        batch: &mut Batch,
    ) -> Result<(), SyncError> {
        let Some(device) = Self::translate(path, root)? else {
            return Ok(());
        };
        match inspect(path).await {
            Local::Missing => debug!(path = %device, "Created entry vanished"),
            Local::Dir => batch.push(
                self.queue
                    .submit(PendingOperation::create_dir(path, device).in_generation(generation)),
            ),
            Local::File(content) => batch.push(
                self.queue.submit_coalescing(
                    PendingOperation::create_file(path, device, content).in_generation(generation),
                ),
            ),
        }
        Ok(())
    }

    async fn changed(
        &self,
        path: &Path,
        root: &SyncRoot,
        generation: Option<u64>,
        batch: &mut Batch,
    ) -> Result<(), SyncError> {
        let Some(device) = Self::translate(path, root)? else {
            return Ok(());
        };
        match inspect(path).await {
            Local::Missing | Local::Dir => {}
            Local::File(content) => batch.push(
                self.queue
                    .submit_coalescing(PendingOperation::update(path, device, content).in_generation(generation)),
            ),
        }
        Ok(())
    }

    fn deleted(&self, path: &Path, root: &SyncRoot, generation: Option<u64>, batch: &mut Batch) -> Result<(), SyncError> {
        let Some(device) = Self::translate(path, root)? else {
            return Ok(());
        };
        let kind = self.mirrored_kind(&device).unwrap_or(FileKind::File);
        batch.push(
            self.queue
                .submit(PendingOperation::delete(path, device, kind).in_generation(generation)),
        );
        Ok(())
    }

    async fn renamed(
        &self,
        from: &Path,
        to: &Path,
        root: &SyncRoot,
        generation: Option<u64>,
        batch: &mut Batch,
    ) -> Result<(), SyncError> {
        let (Some(old), Some(new)) = (Self::translate(from, root)?, Self::translate(to, root)?) else {
            return Ok(());
        };
        let kind = match tokio::fs::metadata(to).await {
            Ok(meta) if meta.is_dir() => FileKind::Directory,
            Ok(_) => FileKind::File,
            Err(_) => {
                debug!(path = %new, "Rename target vanished");
                return self.deleted(from, root, generation, batch);
            }
        };

        if self.supports_rename {
            batch.push(
                self.queue
                    .submit(PendingOperation::rename(to, old, new, kind).in_generation(generation)),
            );
            return Ok(());
        }

        let old_kind = self.mirrored_kind(&old).unwrap_or(kind);
        batch.push(
            self.queue
                .submit(PendingOperation::delete(from, old, old_kind).in_generation(generation)),
        );
        self.created(to, root, generation, batch).await?;
        if kind == FileKind::Directory {
            let walk = walk(to).await;
            for (local, reason) in &walk.unreadable {
                warn!(path = %local.display(), %reason, "Not re-created after rename");
            }
            for (local, entry) in walk.entries {
                let device = match to_device_path(&local, root) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!(error = %e, "Not re-created after rename");
                        continue;
                    }
                };
                let op = match entry {
                    FileKind::Directory => PendingOperation::create_dir(local, device),
                    FileKind::File => match tokio::fs::read(&local).await {
                        Ok(content) => PendingOperation::create_file(local, device, content),
                        Err(e) => {
                            warn!(path = %device, error = %e, "Not re-created after rename");
                            continue;
                        }
                    },
                };
                batch.push(self.queue.submit(op.in_generation(generation)));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Batch {
    queued: usize,
    superseded: usize,
}

impl Batch {
    fn push(&mut self, ticket: Ticket) {
        if ticket.superseded {
            self.superseded += 1;
        } else {
            self.queued += 1;
        }
    }

    fn into_dispatch(self) -> Dispatch {
        match (self.queued, self.superseded) {
            (0, 0) => Dispatch::Ignored,
            (0, _) => Dispatch::Superseded,
            (n, _) => Dispatch::Queued(n),
        }
    }
}
