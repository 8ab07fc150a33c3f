//! Device filesystem mirror and sync engine.
//!
//! This module keeps an in-memory mirror of the device's file tree in step
//! with a watched local directory:
//!
//! - **Paths**: local paths under the sync root map to device-relative paths
//! - **Store**: the mirror, mutated only after the device acknowledges
//! - **Queue**: strict FIFO with a single in-flight operation
//! - **Reconciler**: local change notifications to queued operations
//! - **Bulk**: breadth-first upload of a local subtree
//! - **Session**: the (at most one) active sync root
//!
//! # Data flow
//!
//! ```text
//! local change -> change loop -> reconciler -> queue -> dispatcher -> link
//!                                                          |
//!                                         ack -> store <---+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use devsync::sync::{EngineConfig, LocalChange, SyncEngine, SyncRoot};
//! use devsync::transport::MemoryDevice;
//!
//! let engine = SyncEngine::new(MemoryDevice::new(), EngineConfig::default());
//! engine.connect().await?;
//! engine.start_sync(SyncRoot::new("/proj/device-files")).await?;
//! engine.notify(LocalChange::Created("/proj/device-files/main.py".into()));
//! engine.flush().await;
//! ```

mod bulk;
mod engine;
mod file;
mod hash;
pub mod path;
mod queue;
mod reconciler;
mod session;
mod store;
mod types;

pub use bulk::BulkUploader;
pub use engine::{ChangeSender, EngineConfig, EngineEvent, SyncEngine};
pub use file::atomic_write;
pub use hash::{content_hash, has_changed};
pub use path::{to_device_path, to_local_path};
pub use queue::{OperationQueue, Ticket};
pub use reconciler::{ChangeReconciler, Dispatch};
pub use session::{ActiveSync, SessionState, StopReason, SyncSession};
pub use store::{DeviceFileStore, SharedStore};
pub use types::{
    BulkFailure, BulkStats, DeviceFile, FileKind, LocalChange, OperationKind, Outcome, PendingOperation,
    SyncError, SyncResult, SyncRoot,
};
