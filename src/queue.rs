//! Unbounded blocking FIFO with a permanent "completed" state.
//!
//! Items travel over an unbounded crossbeam channel. Completion drops the
//! only sender of a second channel, which every blocked `select!` sees as
//! a disconnect.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};

use crate::error::{IpcError, IpcResult};

/// Many producers, any number of consumers. Items pushed before
/// [`complete`](Self::complete) stay readable; once drained, every pop
/// returns [`IpcError::QueueClosed`] without blocking.
pub struct MessageQueue<T> {
    items_tx: Sender<T>,
    items_rx: Receiver<T>,
    /// `None` once completed. Pushes hold the read lock while sending, so
    /// nothing lands after `complete` returns.
    closer: RwLock<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        let (items_tx, items_rx) = crossbeam_channel::unbounded();
        let (closer, closed_rx) = crossbeam_channel::bounded(0);
        Self {
            items_tx,
            items_rx,
            closer: RwLock::new(Some(closer)),
            closed_rx,
        }
    }

    pub fn push(&self, item: T) -> IpcResult<()> {
        let closer = self.closer.read().unwrap_or_else(PoisonError::into_inner);
        if closer.is_none() {
            return Err(IpcError::QueueClosed);
        }
        self.items_tx
            .send(item)
            .map_err(|_| IpcError::QueueClosed)
    }

    /// Block until an item arrives or the queue is completed and empty.
    pub fn pop(&self) -> IpcResult<T> {
        select! {
            recv(self.items_rx) -> item => item.map_err(|_| IpcError::QueueClosed),
            recv(self.closed_rx) -> _ => self.drain_one(),
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout` with `Ok(None)`.
    pub fn pop_timeout(&self, timeout: Duration) -> IpcResult<Option<T>> {
        select! {
            recv(self.items_rx) -> item => item.map(Some).map_err(|_| IpcError::QueueClosed),
            recv(self.closed_rx) -> _ => self.drain_one().map(Some),
            default(timeout) => Ok(None),
        }
    }

    /// After completion: hand out what is left, then report closed.
    fn drain_one(&self) -> IpcResult<T> {
        self.items_rx.try_recv().map_err(|_| IpcError::QueueClosed)
    }

    /// Refuse further pushes and release every waiting consumer.
    pub fn complete(&self) {
        let closer = self
            .closer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(closer);
    }

    pub fn is_completed(&self) -> bool {
        self.closer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.items_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items_rx.is_empty()
    }
}
