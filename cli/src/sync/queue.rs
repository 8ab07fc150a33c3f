//! FIFO serialization point for device operations.
//!
//! Every producer (watcher, explicit commands, bulk uploads) submits here and
//! a single dispatcher drains the queue one operation at a time. The queue
//! holds at most one in-flight operation; the next one is not handed out
//! until [`OperationQueue::complete`] reports the previous outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, trace};

use crate::sync::types::{Outcome, PendingOperation};

/// Handle to the eventual outcome of a submitted operation.
#[derive(Debug)]
pub struct Ticket {
    /// Sequence number of the queue entry carrying this submission.
    pub seq: u64,
    /// True if the submission was folded into an already-queued write.
    pub superseded: bool,
    rx: oneshot::Receiver<Outcome>,
}

impl Ticket {
    /// Wait for the operation to finish.
    ///
    /// Resolves to [`Outcome::Cancelled`] if the queue went away first.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Cancelled)
    }
}

#[derive(Debug)]
struct Entry {
    op: PendingOperation,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    in_flight: Option<(u64, Vec<oneshot::Sender<Outcome>>)>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    wakeup: Notify,
    outstanding: watch::Sender<usize>,
}

/// Ordered queue of [`PendingOperation`]s with a single in-flight slot.
#[derive(Debug, Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    #[must_use]
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    next_seq: 1,
                    ..QueueState::default()
                }),
                wakeup: Notify::new(),
                outstanding,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &QueueState) {
        self.shared.outstanding.send_replace(state.outstanding());
    }

    /// Append an operation at the tail.
    pub fn submit(&self, mut op: PendingOperation) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            drop(tx);
            return Ticket { seq: 0, superseded: false, rx };
        }

        op.seq = state.next_seq;
        state.next_seq += 1;
        let seq = op.seq;
        trace!(op = %op, "Queued");
        state.pending.push_back(Entry { op, waiters: vec![tx] });
        self.publish(&state);
        drop(state);

        self.shared.wakeup.notify_one();
        Ticket { seq, superseded: false, rx }
    }

    /// Submit a content write, folding it into a queued write for the same path.
    ///
    /// Only the most recent queue entry touching the path is considered, and
    /// only while it is still waiting. A queued delete, rename or mkdir of an
    /// ancestor directory counts as touching the path, so a write never moves
    /// ahead of it. An in-flight write is never replaced;
    /// the new write then queues behind it.
    pub fn submit_coalescing(&self, op: PendingOperation) -> Ticket {
        if !op.is_content_write() {
            return self.submit(op);
        }

        let mut state = self.lock();
        let target = state
            .pending
            .iter_mut()
            .rev()
            .find(|entry| entry.op.touches(&op.device_path))
            .filter(|entry| entry.op.is_content_write() && entry.op.generation == op.generation);

        if let Some(entry) = target {
            let (tx, rx) = oneshot::channel();
            entry.op.payload = op.payload;
            entry.op.local_path = op.local_path;
            entry.waiters.push(tx);
            let seq = entry.op.seq;
            debug!(seq, path = %op.device_path, "Superseded queued write");
            return Ticket { seq, superseded: true, rx };
        }
        drop(state);

        self.submit(op)
    }

    /// Wait for the next operation and move it into the in-flight slot.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<PendingOperation> {
        loop {
            {
                let mut state = self.lock();
                if let Some(entry) = state.pending.pop_front() {
                    state.in_flight = Some((entry.op.seq, entry.waiters));
                    self.publish(&state);
                    return Some(entry.op);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.wakeup.notified().await;
        }
    }

    /// Report the outcome of the in-flight operation.
    pub fn complete(&self, seq: u64, outcome: Outcome) {
        let mut state = self.lock();
        let waiters = match state.in_flight.take() {
            Some((current, waiters)) if current == seq => waiters,
            other => {
                state.in_flight = other;
                debug!(seq, "Completion for an operation that is not in flight");
                return;
            }
        };
        self.publish(&state);
        drop(state);

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Drop every queued operation; the in-flight one is left alone.
    ///
    /// Returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let discarded: Vec<Entry> = state.pending.drain(..).collect();
        self.publish(&state);
        drop(state);

        for entry in &discarded {
            trace!(op = %entry.op, "Discarded");
        }
        let count = discarded.len();
        for waiter in discarded.into_iter().flat_map(|entry| entry.waiters) {
            let _ = waiter.send(Outcome::Cancelled);
        }
        count
    }

    /// Stop accepting submissions. The dispatcher drains what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.wakeup.notify_one();
    }

    /// Operations waiting to be sent (excluding the in-flight one).
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// Snapshot of the queued operations, in order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.lock().pending.iter().map(|entry| entry.op.clone()).collect()
    }

    /// Wait until nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{FileKind, OperationKind};

    fn update(path: &str, content: &str) -> PendingOperation {
        PendingOperation::update(format!("/r/{path}"), path, content.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_fifo_order_and_sequence() {
        let queue = OperationQueue::new();
        queue.submit(update("a.py", "1"));
        queue.submit(PendingOperation::delete("/r/b.py", "b.py", FileKind::File));
        queue.submit(update("c.py", "3"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let op = queue.next().await.unwrap();
            seen.push((op.seq, op.device_path.clone()));
            queue.complete(op.seq, Outcome::Applied { revision: op.seq });
        }
        assert_eq!(
            seen,
            vec![(1, "a.py".into()), (2, "b.py".into()), (3, "c.py".into())]
        );
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest_payload() {
        let queue = OperationQueue::new();
        let first = queue.submit_coalescing(update("b.py", "old"));
        let second = queue.submit_coalescing(update("b.py", "new"));

        assert!(!first.superseded);
        assert!(second.superseded);
        assert_eq!(first.seq, second.seq);
        assert_eq!(queue.pending_len(), 1);

        let op = queue.next().await.unwrap();
        assert_eq!(op.payload.as_deref(), Some(&b"new"[..]));
        queue.complete(op.seq, Outcome::Applied { revision: 1 });

        assert!(first.wait().await.is_applied());
        assert!(second.wait().await.is_applied());
    }

    #[tokio::test]
    async fn test_in_flight_write_is_not_superseded() {
        let queue = OperationQueue::new();
        queue.submit_coalescing(update("b.py", "one"));
        let in_flight = queue.next().await.unwrap();

        let ticket = queue.submit_coalescing(update("b.py", "two"));
        assert!(!ticket.superseded);
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.has_in_flight());

        queue.complete(in_flight.seq, Outcome::Applied { revision: 1 });
        let next = queue.next().await.unwrap();
        assert_eq!(next.payload.as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn test_coalescing_stops_at_delete() {
        let queue = OperationQueue::new();
        queue.submit_coalescing(update("a.py", "1"));
        queue.submit(PendingOperation::delete("/r/a.py", "a.py", FileKind::File));
        let ticket = queue.submit_coalescing(PendingOperation::create_file("/r/a.py", "a.py", b"2".to_vec()));

        assert!(!ticket.superseded);
        let kinds: Vec<_> = queue.pending().iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Update, OperationKind::Delete, OperationKind::Create]
        );
    }

    #[tokio::test]
    async fn test_coalescing_stops_at_parent_delete() {
        let queue = OperationQueue::new();
        queue.submit_coalescing(update("lib/a.py", "1"));
        queue.submit(PendingOperation::delete("/r/lib", "lib", FileKind::Directory));
        let ticket = queue.submit_coalescing(update("lib/a.py", "2"));

        assert!(!ticket.superseded);
        let pending = queue.pending();
        let order: Vec<_> = pending.iter().map(|op| (op.kind, op.device_path.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (OperationKind::Update, "lib/a.py"),
                (OperationKind::Delete, "lib"),
                (OperationKind::Update, "lib/a.py"),
            ]
        );
        assert_eq!(pending[2].payload.as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn test_coalescing_stops_at_parent_rename() {
        let queue = OperationQueue::new();
        queue.submit_coalescing(update("lib/a.py", "1"));
        queue.submit(PendingOperation::rename("/r/src", "lib", "src", FileKind::Directory));
        let ticket = queue.submit_coalescing(update("lib/a.py", "2"));

        assert!(!ticket.superseded);
        assert_eq!(queue.pending_len(), 3);
    }

    #[tokio::test]
    async fn test_coalescing_skips_unrelated_entries() {
        let queue = OperationQueue::new();
        queue.submit_coalescing(update("lib/a.py", "1"));
        queue.submit(PendingOperation::delete("/r/libs", "libs", FileKind::Directory));
        let ticket = queue.submit_coalescing(update("lib/a.py", "2"));

        assert!(ticket.superseded);
        assert_eq!(queue.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_clear_cancels_waiting() {
        let queue = OperationQueue::new();
        queue.submit(update("a.py", "1"));
        let in_flight = queue.next().await.unwrap();
        let waiting = queue.submit(update("b.py", "2"));

        assert_eq!(queue.clear(), 1);
        assert_eq!(waiting.wait().await, Outcome::Cancelled);
        assert!(queue.has_in_flight());

        queue.complete(in_flight.seq, Outcome::Failed("gone".into()));
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn test_close_ends_dispatch() {
        let queue = OperationQueue::new();
        queue.close();
        assert!(queue.next().await.is_none());
        assert_eq!(queue.submit(update("a.py", "1")).wait().await, Outcome::Cancelled);
    }
}
