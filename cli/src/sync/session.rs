//! Sync session lifecycle.
//!
//! At most one sync root is active at a time. Every start bumps a generation
//! counter; operations carry the generation that produced them so work from
//! a stopped session can be recognised and dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::sync::types::{SyncError, SyncResult, SyncRoot};
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Active,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop.
    Stopped,
    Disconnected,
    /// A firmware update started.
    FirmwareUpdate,
    /// A new session was started in its place.
    Replaced,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::FirmwareUpdate => write!(f, "firmware update started"),
            Self::Replaced => write!(f, "replaced by a new sync"),
        }
    }
}

/// The active root mapping.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSync {
    pub id: Uuid,
    pub root: SyncRoot,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// Holder of the (at most one) active sync root.
#[derive(Debug, Default)]
pub struct SyncSession {
    active: Option<ActiveSync>,
    generation: u64,
}

impl SyncSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `root`, implicitly stopping any previous session.
    ///
    /// Returns the session that was replaced, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncDisallowed`] while firmware is being updated.
    pub fn start(&mut self, root: SyncRoot, connection: ConnectionState) -> SyncResult<Option<ActiveSync>> {
        if connection == ConnectionState::UpdatingFirmware {
            return Err(SyncError::SyncDisallowed { state: connection });
        }

        let replaced = self.stop(StopReason::Replaced);
        self.generation += 1;
        let active = ActiveSync {
            id: Uuid::new_v4(),
            root,
            generation: self.generation,
            started_at: Utc::now(),
        };
        info!(
            root = %active.root.local_root.display(),
            generation = active.generation,
            "Sync started"
        );
        self.active = Some(active);
        Ok(replaced)
    }

    /// Deactivate the current session, if any.
    pub fn stop(&mut self, reason: StopReason) -> Option<ActiveSync> {
        let stopped = self.active.take();
        if let Some(session) = &stopped {
            info!(
                root = %session.root.local_root.display(),
                generation = session.generation,
                %reason,
                "Sync stopped"
            );
        }
        stopped
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Active
        } else {
            SessionState::Inactive
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn active(&self) -> Option<&ActiveSync> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn root(&self) -> Option<&SyncRoot> {
        self.active.as_ref().map(|a| &a.root)
    }

    /// Generation of the most recently started session.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an operation stamped with `generation` may still run.
    ///
    /// Unbound operations (`None`) are always accepted.
    #[must_use]
    pub fn accepts(&self, generation: Option<u64>) -> bool {
        match generation {
            None => true,
            Some(g) => self.active.as_ref().is_some_and(|a| a.generation == g),
        }
    }
}
