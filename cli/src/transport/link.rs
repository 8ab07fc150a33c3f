//! Single-slot ownership of a transport.
//!
//! The link is the only way to reach a [`Transport`]. Acquiring it parks the
//! caller until the current exchange finishes; holding the guard is the busy
//! signal. Callers never check a flag and then send.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ConnectionState, Transport};

#[derive(Debug)]
struct LinkShared {
    busy: AtomicBool,
    state: AtomicU8,
    firmware: AtomicBool,
}

/// Exclusive, shareable handle to a transport.
#[derive(Debug)]
pub struct Link<T> {
    transport: Arc<Mutex<T>>,
    shared: Arc<LinkShared>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T) -> Self {
        let state = transport.state();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            shared: Arc::new(LinkShared {
                busy: AtomicBool::new(false),
                state: AtomicU8::new(state.as_u8()),
                firmware: AtomicBool::new(false),
            }),
        }
    }

    /// Wait for the link to be free and take it.
    pub async fn acquire(&self) -> LinkGuard<T> {
        let guard = Arc::clone(&self.transport).lock_owned().await;
        self.shared.busy.store(true, Ordering::Release);
        LinkGuard {
            guard,
            shared: Arc::clone(&self.shared),
        }
    }

    /// True while an exchange holds the link.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Connection state as of the last released exchange.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.shared.firmware.load(Ordering::Acquire) {
            ConnectionState::UpdatingFirmware
        } else {
            ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
        }
    }

    /// Mark the start or end of a firmware update.
    pub fn set_firmware(&self, updating: bool) {
        self.shared.firmware.store(updating, Ordering::Release);
    }
}

/// Exclusive access to the transport for one exchange.
pub struct LinkGuard<T: Transport> {
    guard: OwnedMutexGuard<T>,
    shared: Arc<LinkShared>,
}

impl<T: Transport> Deref for LinkGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Transport> DerefMut for LinkGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: Transport> Drop for LinkGuard<T> {
    fn drop(&mut self) {
        self.shared.state.store(self.guard.state().as_u8(), Ordering::Release);
        self.shared.busy.store(false, Ordering::Release);
    }
}
