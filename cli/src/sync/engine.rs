//! The sync engine: one dispatcher, one change loop, one link.
//!
//! [`SyncEngine`] owns every piece of shared state. Two background tasks run
//! for its lifetime:
//!
//! - the change loop receives [`LocalChange`]s in arrival order, drops them
//!   while no session is active, and hands the rest to the reconciler
//! - the dispatcher pulls one operation at a time from the queue, performs
//!   it over the exclusive link, and applies the acknowledgment to the store
//!
//! A link failure that implies disconnection ends the session and discards
//! everything still queued.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::sync::bulk::BulkUploader;
use crate::sync::path::to_device_path;
use crate::sync::queue::{OperationQueue, Ticket};
use crate::sync::reconciler::ChangeReconciler;
use crate::sync::session::{ActiveSync, SessionState, StopReason, SyncSession};
use crate::sync::store::{DeviceFileStore, SharedStore};
use crate::sync::types::{
    BulkStats, DeviceFile, FileKind, LocalChange, OperationKind, Outcome, PendingOperation, SyncError,
    SyncResult, SyncRoot,
};
use crate::transport::{
    Ack, ConnectionState, DeviceCommand, Link, Transport, TransportError, TransportResult,
};

const EVENT_CAPACITY: usize = 256;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for one device exchange.
    pub operation_timeout: Duration,
    /// Override the transport's rename capability.
    pub supports_rename: Option<bool>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            supports_rename: None,
        }
    }
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        root: String,
        generation: u64,
        refreshed: bool,
    },
    SessionStopped {
        reason: StopReason,
        discarded: usize,
    },
    Applied {
        seq: u64,
        kind: OperationKind,
        path: String,
        revision: u64,
    },
    Failed {
        seq: u64,
        kind: OperationKind,
        path: String,
        error: String,
    },
    Refreshed {
        revision: u64,
        entries: usize,
    },
}

enum ChangeMsg {
    Change(LocalChange),
    Barrier(oneshot::Sender<()>),
}

/// Cheap handle for feeding local changes into the engine.
#[derive(Clone)]
pub struct ChangeSender {
    tx: mpsc::UnboundedSender<ChangeMsg>,
}

impl ChangeSender {
    /// Queue a change for the change loop. Never blocks.
    ///
    /// Returns `false` once the engine has shut down.
    pub fn send(&self, change: LocalChange) -> bool {
        self.tx.send(ChangeMsg::Change(change)).is_ok()
    }
}

struct Inner<T: Transport> {
    link: Link<T>,
    store: SharedStore,
    session: Mutex<SyncSession>,
    queue: OperationQueue,
    events: broadcast::Sender<EngineEvent>,
    config: EngineConfig,
    supports_rename: bool,
}

/// Run one queued operation against the device.
async fn perform<T: Transport>(transport: &mut T, op: &PendingOperation) -> TransportResult<Ack> {
    match (op.kind, op.entry) {
        (OperationKind::Create | OperationKind::Update, FileKind::File) => {
            let content = op.payload.as_deref().unwrap_or_default();
            transport.send_file(&op.device_path, content).await
        }
        (OperationKind::Create | OperationKind::Update, FileKind::Directory) => {
            let command = DeviceCommand::Mkdir {
                path: op.device_path.clone(),
            };
            transport.send_command(&command).await
        }
        (OperationKind::Delete, _) => {
            let command = DeviceCommand::Remove {
                path: op.device_path.clone(),
            };
            transport.send_command(&command).await
        }
        (OperationKind::Rename, _) => {
            let from = op
                .previous_device_path
                .clone()
                .ok_or_else(|| TransportError::Protocol("rename without a source path".to_string()))?;
            let command = DeviceCommand::Rename {
                from,
                to: op.device_path.clone(),
            };
            transport.send_command(&command).await
        }
    }
}

impl<T: Transport> Inner<T> {
    fn session(&self) -> MutexGuard<'_, SyncSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_read(&self) -> RwLockReadGuard<'_, DeviceFileStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_write(&self) -> RwLockWriteGuard<'_, DeviceFileStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// End the active session (if any) and drop everything queued.
    fn stop_session(&self, reason: StopReason) -> Option<ActiveSync> {
        let stopped = self.session().stop(reason);
        let discarded = self.queue.clear();
        if stopped.is_some() || discarded > 0 {
            self.emit(EngineEvent::SessionStopped { reason, discarded });
        }
        stopped
    }

    async fn with_timeout<R>(&self, exchange: impl Future<Output = TransportResult<R>>) -> TransportResult<R> {
        let limit = self.config.operation_timeout;
        tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(limit)))
    }

    async fn execute(&self, op: &PendingOperation) -> Outcome {
        let mut link = self.link.acquire().await;
        trace!(op = %op, "Sending");
        let result = self.with_timeout(perform(&mut *link, op)).await;

        match result {
            Ok(ack) => {
                let revision = {
                    let mut store = self.store_write();
                    store.apply(op, &ack);
                    store.revision()
                };
                drop(link);
                debug!(op = %op, revision, "Applied");
                self.emit(EngineEvent::Applied {
                    seq: op.seq,
                    kind: op.kind,
                    path: op.device_path.clone(),
                    revision,
                });
                Outcome::Applied { revision }
            }
            Err(e) => {
                drop(link);
                warn!(op = %op, error = %e, "Device operation failed");
                self.emit(EngineEvent::Failed {
                    seq: op.seq,
                    kind: op.kind,
                    path: op.device_path.clone(),
                    error: e.to_string(),
                });
                if e.implies_disconnect() {
                    warn!("Device link lost; sync stopped");
                    self.stop_session(StopReason::Disconnected);
                }
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        while let Some(op) = self.queue.next().await {
            let accepted = self.session().accepts(op.generation);
            let outcome = if accepted {
                self.execute(&op).await
            } else {
                debug!(op = %op, "Dropping operation from a stopped session");
                Outcome::Cancelled
            };
            self.queue.complete(op.seq, outcome);
        }
        debug!("Dispatcher finished");
    }

    async fn change_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ChangeMsg>) {
        let reconciler = ChangeReconciler::new(self.queue.clone(), self.store.clone(), self.supports_rename);
        while let Some(msg) = rx.recv().await {
            match msg {
                ChangeMsg::Barrier(done) => {
                    let _ = done.send(());
                }
                ChangeMsg::Change(change) => {
                    let active = if self.link.state() == ConnectionState::UpdatingFirmware {
                        None
                    } else {
                        self.session().active().cloned()
                    };
                    let Some(active) = active else {
                        trace!(?change, "No active sync; change discarded");
                        continue;
                    };
                    let dispatch = reconciler.reconcile(change, &active).await;
                    trace!(?dispatch, "Change reconciled");
                }
            }
        }
        debug!("Change loop finished");
    }

    /// Rebuild the mirror from a full listing. Caller holds the link.
    async fn refresh_with(&self, transport: &mut T) -> TransportResult<u64> {
        let snapshot = self.with_timeout(transport.list_tree()).await?;
        let entries = snapshot.entries.len();
        let revision = snapshot.revision;
        self.store_write().replace_all(snapshot);
        info!(revision, entries, "Device tree refreshed");
        self.emit(EngineEvent::Refreshed { revision, entries });
        Ok(revision)
    }

    async fn refresh_if_stale(&self) -> TransportResult<bool> {
        let mut link = self.link.acquire().await;
        let device_revision = self.with_timeout(link.tree_revision()).await?;
        if !self.store_read().needs_refresh(device_revision) {
            return Ok(false);
        }
        debug!(device_revision, "Mirror is stale");
        self.refresh_with(&mut link).await?;
        Ok(true)
    }
}

/// Device filesystem mirror plus the machinery that keeps it in sync.
pub struct SyncEngine<T: Transport> {
    inner: Arc<Inner<T>>,
    changes: mpsc::UnboundedSender<ChangeMsg>,
    dispatcher: Option<JoinHandle<()>>,
    change_loop: Option<JoinHandle<()>>,
}

impl<T: Transport> SyncEngine<T> {
    /// Build the engine and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: T, config: EngineConfig) -> Self {
        let supports_rename = config
            .supports_rename
            .unwrap_or_else(|| transport.supports_rename());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            link: Link::new(transport),
            store: DeviceFileStore::shared(),
            session: Mutex::new(SyncSession::new()),
            queue: OperationQueue::new(),
            events,
            config,
            supports_rename,
        });

        let (changes, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(Arc::clone(&inner).dispatch_loop());
        let change_loop = tokio::spawn(Arc::clone(&inner).change_loop(rx));
        Self {
            inner,
            changes,
            dispatcher: Some(dispatcher),
            change_loop: Some(change_loop),
        }
    }

    /// Open the link and bring the mirror up to date.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the device cannot be reached.
    pub async fn connect(&self) -> SyncResult<()> {
        {
            let mut link = self.inner.link.acquire().await;
            link.connect().await?;
        }
        info!("Device connected");
        self.inner.refresh_if_stale().await?;
        Ok(())
    }

    /// Stop syncing, drop queued work and close the link.
    pub async fn disconnect(&self) {
        self.inner.stop_session(StopReason::Disconnected);
        let mut link = self.inner.link.acquire().await;
        link.disconnect().await;
        info!("Device disconnected");
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.link.state()
    }

    /// True while an exchange holds the link.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.link.is_busy()
    }

    /// Start mirroring `root`, replacing any active session.
    ///
    /// The mirror is refreshed first if the device revision diverged.
    ///
    /// # Errors
    ///
    /// Fails while firmware is being updated, when the device is not
    /// connected, or if the refresh fails.
    pub async fn start_sync(&self, root: SyncRoot) -> SyncResult<ActiveSync> {
        let state = self.connection_state();
        if state == ConnectionState::UpdatingFirmware {
            return Err(SyncError::SyncDisallowed { state });
        }
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected.into());
        }

        let refreshed = self.inner.refresh_if_stale().await?;

        let (replaced, active) = {
            let mut session = self.inner.session();
            let replaced = session.start(root, self.connection_state())?;
            let active = session.active().cloned().ok_or(SyncError::NoActiveSession)?;
            (replaced, active)
        };
        if replaced.is_some() {
            let discarded = self.inner.queue.clear();
            self.inner.emit(EngineEvent::SessionStopped {
                reason: StopReason::Replaced,
                discarded,
            });
        }

        self.inner.emit(EngineEvent::SessionStarted {
            root: active.root.local_root.display().to_string(),
            generation: active.generation,
            refreshed,
        });
        Ok(active)
    }

    /// Stop the active session; queued operations are discarded, the one in
    /// flight finishes.
    pub fn stop_sync(&self) -> Option<ActiveSync> {
        self.inner.stop_session(StopReason::Stopped)
    }

    /// Block sync for the duration of a firmware update.
    pub fn begin_firmware_update(&self) {
        self.inner.link.set_firmware(true);
        self.inner.stop_session(StopReason::FirmwareUpdate);
    }

    pub fn end_firmware_update(&self) {
        self.inner.link.set_firmware(false);
    }

    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.inner.session().state()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<ActiveSync> {
        self.inner.session().active().cloned()
    }

    /// Handle for the local change source.
    #[must_use]
    pub fn change_sender(&self) -> ChangeSender {
        ChangeSender {
            tx: self.changes.clone(),
        }
    }

    /// Feed one local change.
    pub fn notify(&self, change: LocalChange) {
        let _ = self.changes.send(ChangeMsg::Change(change));
    }

    /// Submit an explicit operation, bypassing the reconciler.
    pub fn submit(&self, op: PendingOperation) -> Ticket {
        self.inner.queue.submit(op)
    }

    /// Queue an update of one local file under the active root.
    ///
    /// # Errors
    ///
    /// [`SyncError::NoActiveSession`] without an active sync,
    /// [`SyncError::InvalidPath`] outside its root, or the read error.
    pub async fn submit_update(&self, local_path: &Path) -> SyncResult<Ticket> {
        let active = self.active_session().ok_or(SyncError::NoActiveSession)?;
        let device_path = to_device_path(local_path, &active.root)?;
        let content = tokio::fs::read(local_path).await?;
        let op = PendingOperation::update(local_path, device_path, content).in_generation(Some(active.generation));
        Ok(self.inner.queue.submit_coalescing(op))
    }

    /// Upload a local file or directory under `root`.
    ///
    /// # Errors
    ///
    /// Fails if `subtree` is outside `root` or unreadable; per-entry
    /// failures are tallied in the returned stats.
    pub async fn upload(&self, root: &SyncRoot, subtree: &Path) -> SyncResult<BulkStats> {
        BulkUploader::new(self.inner.queue.clone(), self.inner.store.clone())
            .upload(root, subtree, None)
            .await
    }

    /// Force a full listing of the device tree.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the listing fails.
    pub async fn refresh(&self) -> SyncResult<u64> {
        let mut link = self.inner.link.acquire().await;
        Ok(self.inner.refresh_with(&mut link).await?)
    }

    /// Children of a device directory.
    #[must_use]
    pub fn list(&self, device_path: &str) -> Vec<DeviceFile> {
        self.inner
            .store_read()
            .list(device_path)
            .into_iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, device_path: &str) -> Option<DeviceFile> {
        self.inner.store_read().get(device_path).cloned()
    }

    /// Content of a device file, read from the device on a cache miss.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if the path is not mirrored,
    /// [`SyncError::NotAFile`] for directories, or the transport error.
    pub async fn open(&self, device_path: &str) -> SyncResult<Vec<u8>> {
        match self.get(device_path) {
            None => return Err(SyncError::NotFound(device_path.to_string())),
            Some(entry) if entry.is_dir() => return Err(SyncError::NotAFile(device_path.to_string())),
            Some(DeviceFile {
                content: Some(content),
                ..
            }) => return Ok(content),
            Some(_) => {}
        }

        let mut link = self.inner.link.acquire().await;
        let content = self.inner.with_timeout(link.read_file(device_path)).await?;
        self.inner
            .store_write()
            .cache_content(device_path, content.clone());
        Ok(content)
    }

    /// Execute code on the device once queued writes have gone out.
    ///
    /// # Errors
    ///
    /// Returns the transport error, including interpreter exceptions.
    pub async fn run(&self, code: &[u8]) -> SyncResult<String> {
        self.inner.queue.wait_idle().await;
        let mut link = self.inner.link.acquire().await;
        Ok(self.inner.with_timeout(link.send_raw(code)).await?)
    }

    /// Wait until every change sent so far has been reconciled.
    pub async fn drain_changes(&self) {
        let (tx, rx) = oneshot::channel();
        if self.changes.send(ChangeMsg::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until every change sent so far has reached the device.
    pub async fn flush(&self) {
        self.drain_changes().await;
        self.inner.queue.wait_idle().await;
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    #[must_use]
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.inner.store)
    }

    /// Stop taking changes, let queued work finish and close the link.
    pub async fn shutdown(mut self) {
        if let Some(change_loop) = self.change_loop.take() {
            change_loop.abort();
        }
        self.inner.queue.close();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        self.inner.link.acquire().await.disconnect().await;
    }
}

impl<T: Transport> Drop for SyncEngine<T> {
    fn drop(&mut self) {
        self.inner.queue.close();
        for task in [self.dispatcher.take(), self.change_loop.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryDevice, Request};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        root: PathBuf,
        device: MemoryDevice,
        engine: SyncEngine<MemoryDevice>,
    }

    async fn harness_with(device: MemoryDevice) -> Harness {
        harness_configured(device, EngineConfig::default()).await
    }

    async fn harness_configured(device: MemoryDevice, config: EngineConfig) -> Harness {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("device-files");
        fs::create_dir_all(&root).unwrap();
        let engine = SyncEngine::new(device.clone(), config);
        engine.connect().await.unwrap();
        engine.start_sync(SyncRoot::new(&root)).await.unwrap();
        Harness {
            _temp: temp,
            root,
            device,
            engine,
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryDevice::new()).await
    }

    impl Harness {
        fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, content).unwrap();
            path
        }

        fn writes_to(&self, device_path: &str) -> Vec<String> {
            self.device
                .writes()
                .into_iter()
                .filter(|(path, _)| path == device_path)
                .map(|(_, content)| String::from_utf8(content).unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let h = harness().await;
        let file = h.write("a.py", "print(1)");

        h.engine.notify(LocalChange::Created(file.clone()));
        h.engine.flush().await;
        assert!(h.engine.get("a.py").is_some());
        assert_eq!(h.device.file("a.py").as_deref(), Some(&b"print(1)"[..]));

        fs::remove_file(&file).unwrap();
        h.engine.notify(LocalChange::Deleted(file));
        h.engine.flush().await;
        assert!(h.engine.get("a.py").is_none());
        assert!(h.engine.list("").is_empty());
    }

    #[tokio::test]
    async fn test_rename_keeps_content_and_revision() {
        let h = harness().await;
        let old = h.write("old.py", "x = 1");
        h.engine.notify(LocalChange::Created(old.clone()));
        h.engine.flush().await;
        let before = h.engine.get("old.py").unwrap();

        let new = h.root.join("new.py");
        fs::rename(&old, &new).unwrap();
        h.engine.notify(LocalChange::Renamed { from: old, to: new });
        h.engine.flush().await;

        assert!(h.engine.get("old.py").is_none());
        let after = h.engine.get("new.py").unwrap();
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(after.last_acked_revision, before.last_acked_revision);
        assert!(h.device.contains("new.py"));
    }

    #[tokio::test]
    async fn test_queued_updates_are_superseded() {
        let h = harness().await;
        let blocker = h.write("blocker.py", "");
        h.device.hold();
        h.engine.notify(LocalChange::Created(blocker));
        h.device.wait_for_in_flight(1).await;

        let file = h.write("b.py", "first");
        h.engine.notify(LocalChange::Changed(file.clone()));
        h.engine.drain_changes().await;
        h.write("b.py", "second");
        h.engine.notify(LocalChange::Changed(file));
        h.engine.drain_changes().await;
        assert_eq!(h.engine.queue().pending_len(), 1);

        h.device.release();
        h.engine.flush().await;
        assert_eq!(h.writes_to("b.py"), vec!["second"]);
    }

    #[tokio::test]
    async fn test_update_in_flight_is_not_superseded() {
        let h = harness().await;
        let file = h.write("b.py", "one");
        h.device.hold();
        h.engine.notify(LocalChange::Changed(file.clone()));
        h.device.wait_for_in_flight(1).await;

        h.write("b.py", "two");
        h.engine.notify(LocalChange::Changed(file));
        h.engine.drain_changes().await;
        assert_eq!(h.engine.queue().pending_len(), 1);

        h.device.release();
        h.engine.flush().await;
        assert_eq!(h.writes_to("b.py"), vec!["one", "two"]);
        assert_eq!(
            h.engine.get("b.py").unwrap().content.as_deref(),
            Some(&b"two"[..])
        );
    }

    #[tokio::test]
    async fn test_strict_order_single_flight() {
        let h = harness().await;
        h.device.set_latency(Duration::from_millis(2));
        let mut events = h.engine.subscribe();

        for i in 0..5 {
            let file = h.write(&format!("f{i}.py"), &i.to_string());
            h.engine.notify(LocalChange::Created(file));
        }
        h.engine.drain_changes().await;
        h.engine
            .submit(PendingOperation::create_dir(h.root.join("lib"), "lib"));
        h.engine.flush().await;

        assert_eq!(h.device.max_in_flight(), 1);
        let paths: Vec<_> = h
            .device
            .mutations()
            .into_iter()
            .map(|request| match request {
                Request::SendFile { path, .. } => path,
                Request::Command(DeviceCommand::Mkdir { path }) => path,
                other => panic!("unexpected request {other:?}"),
            })
            .collect();
        assert_eq!(paths, vec!["f0.py", "f1.py", "f2.py", "f3.py", "f4.py", "lib"]);

        let mut seqs = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Applied { seq, .. } = event {
                seqs.push(seq);
            }
        }
        assert_eq!(seqs.len(), 6);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_disconnect_in_flight() {
        let h = harness().await;
        let a = h.write("a.py", "v1");
        h.engine.notify(LocalChange::Created(a.clone()));
        h.engine.flush().await;
        let revision = h.engine.store().read().unwrap().revision();

        h.device.hold();
        h.write("a.py", "v2");
        h.engine.notify(LocalChange::Changed(a));
        h.device.wait_for_in_flight(1).await;
        let c = h.write("c.py", "queued");
        h.engine.notify(LocalChange::Created(c));
        h.engine.drain_changes().await;
        assert_eq!(h.engine.queue().pending_len(), 1);

        let mut events = h.engine.subscribe();
        h.device.drop_link();
        h.engine.flush().await;

        assert_eq!(h.engine.session_state(), SessionState::Inactive);
        assert_eq!(h.engine.get("a.py").unwrap().content.as_deref(), Some(&b"v1"[..]));
        assert!(h.engine.get("c.py").is_none());
        assert_eq!(h.engine.store().read().unwrap().revision(), revision);
        assert!(h.writes_to("c.py").is_empty());

        let mut stopped = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SessionStopped { reason, discarded } = event {
                stopped = Some((reason, discarded));
            }
        }
        assert_eq!(stopped, Some((StopReason::Disconnected, 1)));
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_stop_queue() {
        let h = harness().await;
        h.device.fail_next(TransportError::Device("OSError: 28".into()));
        let bad = h.write("bad.py", "x");
        let good = h.write("good.py", "y");
        h.engine.notify(LocalChange::Created(bad));
        h.engine.notify(LocalChange::Created(good));
        h.engine.flush().await;

        assert!(h.engine.get("bad.py").is_none());
        assert!(h.engine.get("good.py").is_some());
        assert_eq!(h.engine.session_state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_bulk_upload_three_files() {
        let h = harness().await;
        h.write("one.py", "1");
        h.write("two.py", "2");
        h.write("three.py", "3");
        h.device.set_latency(Duration::from_millis(1));

        let root = SyncRoot::new(&h.root);
        let stats = h.engine.upload(&root, &h.root).await.unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.unchanged, 0);
        assert!(stats.is_clean());
        assert_eq!(h.device.mutations().len(), 3);
        assert_eq!(h.device.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_bulk_upload_continues_after_failure() {
        // A directory squatting on lib/a.py makes that one write fail.
        let device = MemoryDevice::new().with_files([("lib/a.py/x", &b""[..])]);
        let h = harness_with(device).await;
        h.write("lib/a.py", "a");
        h.write("lib/b.py", "b");
        h.write("main.py", "m");

        let root = SyncRoot::new(&h.root);
        let stats = h.engine.upload(&root, &h.root).await.unwrap();

        assert_eq!(stats.directories, 0);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failures[0].path, "lib/a.py");
        assert!(h.engine.get("lib/b.py").is_some());
        assert!(h.engine.get("main.py").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bulk_upload_skips_untranslatable_name() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let h = harness().await;
        h.write("a.py", "a");
        h.write("c.py", "c");
        fs::write(h.root.join(OsStr::from_bytes(b"bad\xff.py")), "b").unwrap();

        let root = SyncRoot::new(&h.root);
        let stats = h.engine.upload(&root, &h.root).await.unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.failed, 1);
        assert!(h.device.contains("a.py"));
        assert!(h.device.contains("c.py"));
    }

    #[tokio::test]
    async fn test_write_behind_parent_delete_survives() {
        let h = harness().await;
        let blocker = h.write("blocker.py", "");
        h.device.hold();
        h.engine.notify(LocalChange::Created(blocker));
        h.device.wait_for_in_flight(1).await;

        let file = h.write("lib/a.py", "v1");
        h.engine.notify(LocalChange::Created(file.clone()));
        h.engine.drain_changes().await;
        h.engine.notify(LocalChange::Deleted(h.root.join("lib")));
        h.engine.drain_changes().await;
        h.write("lib/a.py", "v2");
        h.engine.notify(LocalChange::Created(file));
        h.engine.drain_changes().await;
        assert_eq!(h.engine.queue().pending_len(), 3);

        h.device.release();
        h.engine.flush().await;
        assert_eq!(h.device.file("lib/a.py").as_deref(), Some(&b"v2"[..]));
        assert!(h.engine.get("lib/a.py").is_some());
    }

    #[tokio::test]
    async fn test_timeout_marks_operation_failed() {
        let config = EngineConfig {
            operation_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let h = harness_configured(MemoryDevice::new(), config).await;
        let file = h.write("slow.py", "x");
        h.device.hold();

        let ticket = h.engine.submit_update(&file).await.unwrap();
        let outcome = ticket.wait().await;

        assert!(matches!(outcome, Outcome::Failed(ref reason) if reason.contains("50ms")));
        assert!(h.engine.get("slow.py").is_none());
        assert_eq!(h.engine.session_state(), SessionState::Active);

        h.device.release();
        let ticket = h.engine.submit_update(&file).await.unwrap();
        assert!(ticket.wait().await.is_applied());
        assert!(h.engine.get("slow.py").is_some());
    }

    #[tokio::test]
    async fn test_reupload_reports_unchanged() {
        let h = harness().await;
        h.write("a.py", "same");
        h.write("b.py", "old");
        let root = SyncRoot::new(&h.root);
        h.engine.upload(&root, &h.root).await.unwrap();

        h.write("b.py", "new");
        let stats = h.engine.upload(&root, &h.root).await.unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.unchanged, 1);
    }

    #[tokio::test]
    async fn test_submit_update_requires_session() {
        let h = harness().await;
        let file = h.write("main.py", "print(2)");
        let ticket = h.engine.submit_update(&file).await.unwrap();
        assert!(ticket.wait().await.is_applied());
        assert_eq!(h.device.file("main.py").as_deref(), Some(&b"print(2)"[..]));

        h.engine.stop_sync();
        assert!(matches!(
            h.engine.submit_update(&file).await,
            Err(SyncError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_events_discarded_while_inactive() {
        let h = harness().await;
        h.engine.stop_sync();
        let file = h.write("a.py", "x");
        h.engine.notify(LocalChange::Created(file));
        h.engine.flush().await;

        assert!(h.device.mutations().is_empty());
        assert!(h.engine.get("a.py").is_none());
    }

    #[tokio::test]
    async fn test_firmware_update_blocks_sync() {
        let h = harness().await;
        h.engine.begin_firmware_update();
        assert_eq!(h.engine.session_state(), SessionState::Inactive);
        assert_eq!(h.engine.connection_state(), ConnectionState::UpdatingFirmware);

        let err = h.engine.start_sync(SyncRoot::new(&h.root)).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncDisallowed { .. }));

        h.engine.end_firmware_update();
        h.engine.start_sync(SyncRoot::new(&h.root)).await.unwrap();
        assert_eq!(h.engine.session_state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_start_replaces_previous_root() {
        let h = harness().await;
        let first = h.engine.active_session().unwrap();
        let other = h.root.parent().unwrap().join("other");
        fs::create_dir_all(&other).unwrap();

        let second = h.engine.start_sync(SyncRoot::new(&other)).await.unwrap();
        assert_eq!(second.generation, first.generation + 1);

        let old = h.write("ignored.py", "x");
        h.engine.notify(LocalChange::Created(old));
        fs::write(other.join("kept.py"), "y").unwrap();
        h.engine.notify(LocalChange::Created(other.join("kept.py")));
        h.engine.flush().await;

        assert!(h.engine.get("ignored.py").is_none());
        assert!(h.engine.get("kept.py").is_some());
    }

    #[tokio::test]
    async fn test_connect_loads_existing_tree() {
        let device = MemoryDevice::new().with_files([("main.py", &b"print(1)"[..]), ("lib/u.py", &b""[..])]);
        let h = harness_with(device).await;

        let root: Vec<_> = h.engine.list("").into_iter().map(|e| e.path).collect();
        assert_eq!(root, vec!["lib", "main.py"]);
        assert!(h.engine.get("main.py").unwrap().content.is_none());

        assert_eq!(h.engine.open("main.py").await.unwrap(), b"print(1)");
        assert!(h.engine.get("main.py").unwrap().content.is_some());
        assert!(matches!(h.engine.open("lib").await, Err(SyncError::NotAFile(_))));
        assert!(matches!(h.engine.open("nope.py").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_revision_mismatch_triggers_refresh() {
        let h = harness().await;
        h.engine.stop_sync();
        h.device.put_file("external.py", b"made elsewhere");

        h.engine.start_sync(SyncRoot::new(&h.root)).await.unwrap();

        assert!(h.engine.get("external.py").is_some());
        let reads: Vec<_> = h
            .device
            .requests()
            .into_iter()
            .filter(|r| *r == Request::ListTree)
            .collect();
        assert_eq!(reads.len(), 2);
    }

    #[tokio::test]
    async fn test_run_waits_for_queue() {
        let h = harness().await;
        let file = h.write("main.py", "print(1)");
        h.engine.notify(LocalChange::Created(file));
        h.engine.drain_changes().await;

        h.engine.run(b"import main").await.unwrap();

        let requests = h.device.requests();
        let write = requests
            .iter()
            .position(|r| matches!(r, Request::SendFile { .. }))
            .unwrap();
        let raw = requests
            .iter()
            .position(|r| matches!(r, Request::Raw(_)))
            .unwrap();
        assert!(write < raw);
    }
}
