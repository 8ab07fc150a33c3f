//! In-process device.
//!
//! Backs `--device sim` and every engine test. It keeps a real file tree and
//! revision counter, records each request, and can be paused mid-exchange,
//! made to fail, or have its link dropped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

use super::{Ack, DeviceCommand, DeviceEntry, DeviceSnapshot, Transport, TransportError, TransportResult};
use crate::sync::{FileKind, path};

/// A request as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect,
    SendFile { path: String, content: Vec<u8> },
    Command(DeviceCommand),
    Raw(Vec<u8>),
    ReadFile(String),
    TreeRevision,
    ListTree,
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug)]
struct DeviceState {
    connected: bool,
    nodes: BTreeMap<String, Node>,
    revision: u64,
    log: Vec<Request>,
    failures: VecDeque<TransportError>,
    supports_rename: bool,
    latency: Duration,
}

impl DeviceState {
    fn make_parents(&mut self, device_path: &str) -> TransportResult<()> {
        for ancestor in path::ancestors(device_path) {
            match self.nodes.get(ancestor) {
                Some(Node::File(_)) => {
                    return Err(TransportError::Device(format!("ENOTDIR: {ancestor}")));
                }
                Some(Node::Dir) => {}
                None => {
                    self.nodes.insert(ancestor.to_string(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    fn subtree(&self, root: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|key| path::is_within(key, root))
            .cloned()
            .collect()
    }

    fn write(&mut self, device_path: &str, content: Vec<u8>) -> TransportResult<Ack> {
        let key = path::normalize(device_path);
        if matches!(self.nodes.get(key), Some(Node::Dir)) {
            return Err(TransportError::Device(format!("EISDIR: {key}")));
        }
        self.make_parents(key)?;
        self.nodes.insert(key.to_string(), Node::File(content));
        Ok(self.bump())
    }

    fn command(&mut self, command: &DeviceCommand) -> TransportResult<Ack> {
        match command {
            DeviceCommand::Mkdir { path: dir } => {
                let key = path::normalize(dir);
                if matches!(self.nodes.get(key), Some(Node::File(_))) {
                    return Err(TransportError::Device(format!("EEXIST: {key}")));
                }
                self.make_parents(key)?;
                self.nodes.insert(key.to_string(), Node::Dir);
            }
            DeviceCommand::Remove { path: target } => {
                let key = path::normalize(target);
                if !self.nodes.contains_key(key) {
                    return Err(TransportError::Device(format!("ENOENT: {key}")));
                }
                for victim in self.subtree(key) {
                    self.nodes.remove(&victim);
                }
            }
            DeviceCommand::Rename { from, to } => {
                if !self.supports_rename {
                    return Err(TransportError::Unsupported("rename"));
                }
                let (from, to) = (path::normalize(from), path::normalize(to));
                if !self.nodes.contains_key(from) {
                    return Err(TransportError::Device(format!("ENOENT: {from}")));
                }
                self.make_parents(to)?;
                for old in self.subtree(from) {
                    if let Some(node) = self.nodes.remove(&old) {
                        self.nodes.insert(format!("{to}{}", &old[from.len()..]), node);
                    }
                }
            }
        }
        Ok(self.bump())
    }

    fn bump(&mut self) -> Ack {
        self.revision += 1;
        Ack {
            revision: self.revision,
        }
    }
}

/// Simulated device reachable without hardware.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
    hold: Arc<watch::Sender<bool>>,
    in_flight: Arc<watch::Sender<usize>>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    /// Empty, disconnected device that supports rename.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                connected: false,
                nodes: BTreeMap::new(),
                revision: 0,
                log: Vec::new(),
                failures: VecDeque::new(),
                supports_rename: true,
                latency: Duration::ZERO,
            })),
            hold: Arc::new(watch::channel(false).0),
            in_flight: Arc::new(watch::channel(0).0),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Toggle rename support.
    #[must_use]
    pub fn with_rename(self, supported: bool) -> Self {
        self.lock().supports_rename = supported;
        self
    }

    /// Seed files. Each one bumps the device revision.
    #[must_use]
    pub fn with_files<'a>(self, files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        for (path, content) in files {
            self.put_file(path, content);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a file behind the engine's back (no request is logged).
    pub fn put_file(&self, device_path: &str, content: &[u8]) {
        let _ = self.lock().write(device_path, content.to_vec());
    }

    /// Delay added to every exchange.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make the next exchange fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.lock().failures.push_back(error);
    }

    /// Park every exchange until [`release`](Self::release).
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Cut the link. A held exchange fails with a disconnect.
    pub fn drop_link(&self) {
        self.lock().connected = false;
        self.release();
    }

    /// Wait until `count` exchanges are in progress.
    pub async fn wait_for_in_flight(&self, count: usize) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Highest number of overlapping exchanges observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.lock().log.clone()
    }

    /// `(path, content)` of every file write, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::SendFile { path, content } => Some((path, content)),
                _ => None,
            })
            .collect()
    }

    /// Mutating requests only (file writes and structural commands).
    #[must_use]
    pub fn mutations(&self) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| matches!(request, Request::SendFile { .. } | Request::Command(_)))
            .collect()
    }

    /// Current content of a device file.
    #[must_use]
    pub fn file(&self, device_path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path::normalize(device_path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, device_path: &str) -> bool {
        self.lock().nodes.contains_key(path::normalize(device_path))
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    async fn exchange<R>(
        &self,
        request: Request,
        handle: impl FnOnce(&mut DeviceState) -> TransportResult<R>,
    ) -> TransportResult<R> {
        let connecting = request == Request::Connect;
        let latency = {
            let mut state = self.lock();
            if !state.connected && !connecting {
                return Err(TransportError::NotConnected);
            }
            trace!(?request, "Device request");
            state.log.push(request);
            state.latency
        };

        self.in_flight.send_modify(|n| *n += 1);
        self.max_in_flight
            .fetch_max(*self.in_flight.borrow(), Ordering::SeqCst);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut hold = self.hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;

        let result = {
            let mut state = self.lock();
            if let Some(error) = state.failures.pop_front() {
                Err(error)
            } else if !state.connected && !connecting {
                Err(TransportError::Disconnected("link dropped".to_string()))
            } else {
                handle(&mut state)
            }
        };

        self.in_flight.send_modify(|n| *n -= 1);
        result
    }
}

impl Transport for MemoryDevice {
    async fn connect(&mut self) -> TransportResult<()> {
        self.exchange(Request::Connect, |state| {
            state.connected = true;
            Ok(())
        })
        .await
    }

    async fn disconnect(&mut self) {
        self.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn supports_rename(&self) -> bool {
        self.lock().supports_rename
    }

    async fn send_file(&mut self, path: &str, content: &[u8]) -> TransportResult<Ack> {
        let request = Request::SendFile {
            path: path.to_string(),
            content: content.to_vec(),
        };
        self.exchange(request, |state| state.write(path, content.to_vec())).await
    }

    async fn send_command(&mut self, command: &DeviceCommand) -> TransportResult<Ack> {
        self.exchange(Request::Command(command.clone()), |state| state.command(command))
            .await
    }

    async fn send_raw(&mut self, code: &[u8]) -> TransportResult<String> {
        self.exchange(Request::Raw(code.to_vec()), |_| Ok(String::new())).await
    }

    async fn read_file(&mut self, path: &str) -> TransportResult<Vec<u8>> {
        let key = path::normalize(path).to_string();
        self.exchange(Request::ReadFile(key.clone()), move |state| match state.nodes.get(&key) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(TransportError::Device(format!("EISDIR: {key}"))),
            None => Err(TransportError::Device(format!("ENOENT: {key}"))),
        })
        .await
    }

    async fn tree_revision(&mut self) -> TransportResult<u64> {
        self.exchange(Request::TreeRevision, |state| Ok(state.revision)).await
    }

    async fn list_tree(&mut self) -> TransportResult<DeviceSnapshot> {
        self.exchange(Request::ListTree, |state| {
            let entries = state
                .nodes
                .iter()
                .map(|(path, node)| match node {
                    Node::File(content) => DeviceEntry {
                        path: path.clone(),
                        kind: FileKind::File,
                        size: content.len() as u64,
                    },
                    Node::Dir => DeviceEntry {
                        path: path.clone(),
                        kind: FileKind::Directory,
                        size: 0,
                    },
                })
                .collect();
            Ok(DeviceSnapshot {
                revision: state.revision,
                entries,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> MemoryDevice {
        let mut device = MemoryDevice::new();
        device.connect().await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mut device = MemoryDevice::new();
        let err = device.send_file("a.py", b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_bumps_revision() {
        let mut device = connected().await;
        let ack = device.send_file("lib/ui/a.py", b"x = 1").await.unwrap();

        assert_eq!(ack.revision, 1);
        assert_eq!(device.file("lib/ui/a.py").as_deref(), Some(&b"x = 1"[..]));

        let snapshot = device.list_tree().await.unwrap();
        let paths: Vec<_> = snapshot.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["lib", "lib/ui", "lib/ui/a.py"]);
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let mut device = connected().await;
        device.send_file("a/x.py", b"1").await.unwrap();
        device
            .send_command(&DeviceCommand::Rename { from: "a".into(), to: "b".into() })
            .await
            .unwrap();
        assert!(device.contains("b/x.py"));
        assert!(!device.contains("a"));

        device.send_command(&DeviceCommand::Remove { path: "b".into() }).await.unwrap();
        assert!(!device.contains("b/x.py"));

        let err = device
            .send_command(&DeviceCommand::Remove { path: "b".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Device(_)));
    }

    #[tokio::test]
    async fn test_rename_unsupported() {
        let mut device = MemoryDevice::new().with_rename(false);
        device.connect().await.unwrap();
        device.send_file("a.py", b"").await.unwrap();
        let err = device
            .send_command(&DeviceCommand::Rename { from: "a.py".into(), to: "b.py".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_fail_next() {
        let mut device = connected().await;
        device.fail_next(TransportError::Device("OSError: 28".into()));
        assert!(device.send_file("a.py", b"").await.is_err());
        assert!(device.send_file("a.py", b"").await.is_ok());
        assert_eq!(device.revision(), 1);
    }

    #[tokio::test]
    async fn test_drop_link_fails_held_exchange() {
        let device = connected().await;
        device.hold();

        let mut sender = device.clone();
        let task = tokio::spawn(async move { sender.send_file("a.py", b"x").await });
        device.wait_for_in_flight(1).await;
        device.drop_link();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.implies_disconnect());
        assert!(!device.contains("a.py"));
    }
}
