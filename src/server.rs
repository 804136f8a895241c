//! Server responsibilities:
//! - accept peers on the well-known endpoint, one handshake at a time
//! - keep the set of live, authorized connections
//! - spawn a reader thread per connection feeding one shared inbox
//! - broadcast outbound lines to every live connection

use std::collections::BTreeMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::cancel::{CancelGuard, CancellationScope, WorkerHandle};
use crate::config::{EndpointAddress, ServerConfig};
use crate::connection::PeerConnection;
use crate::error::{IpcError, IpcResult};
use crate::net;
use crate::queue::MessageQueue;
use crate::types::{InboundMessage, OnConnect, PeerId, SharedInbox};

/// Live connections keyed by accept serial.
///
/// Inserted by the acceptor, removed by a connection's own reader loop when
/// it ends, iterated by broadcasts and disposal. Iteration works on a
/// snapshot, so no lock is held while writing to peers.
#[derive(Default)]
pub struct ConnectionSet {
    inner: RwLock<BTreeMap<u64, Arc<PeerConnection>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<PeerConnection>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.serial(), conn);
    }

    pub fn remove(&self, serial: u64) -> Option<Arc<PeerConnection>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&serial)
    }

    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        std::mem::take(&mut *self.inner.write().unwrap_or_else(PoisonError::into_inner))
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the acceptor thread needs, cloned out of the aggregator.
struct AcceptContext {
    scope: CancellationScope,
    inbox: SharedInbox,
    connections: Arc<ConnectionSet>,
    callbacks: Arc<[OnConnect]>,
    handshake_timeout: Duration,
    join_timeout: Duration,
    accepting: Arc<AtomicBool>,
}

#[derive(Debug)]
enum AcceptStep {
    Stop,
    Skip,
    Fault(IpcError),
}

/// A failed accept ends the loop; a stream that was accepted but could not
/// be set up only costs that one peer.
fn after_failed_accept(conn: &PeerConnection, err: IpcError) -> AcceptStep {
    match err {
        IpcError::Cancelled => AcceptStep::Stop,
        err if conn.state().is_terminal() => {
            tracing::warn!(serial = conn.serial(), error = %err, "dropping accepted stream");
            AcceptStep::Skip
        }
        err => AcceptStep::Fault(IpcError::AcceptorFault(format!("accept failed: {err}"))),
    }
}

fn run_accept_loop(listener: UnixListener, ctx: AcceptContext) {
    let mut serial = 0u64;
    let outcome = loop {
        if ctx.scope.is_cancelled() {
            break Ok(());
        }
        serial += 1;
        let conn = Arc::new(PeerConnection::new(serial));
        if let Err(err) = conn.wait_for_connection(&listener, &ctx.scope) {
            match after_failed_accept(&conn, err) {
                AcceptStep::Stop => break Ok(()),
                AcceptStep::Skip => continue,
                AcceptStep::Fault(err) => break Err(err),
            }
        }

        // sequential: the next peer waits until this handshake settles
        if conn.authenticate(ctx.handshake_timeout).is_err() {
            continue;
        }
        if ctx.scope.is_cancelled() {
            conn.dispose(ctx.join_timeout);
            break Ok(());
        }

        ctx.connections.insert(Arc::clone(&conn));
        let connections = Arc::clone(&ctx.connections);
        let started = conn.start_streaming(ctx.inbox.clone(), move |closed| {
            connections.remove(closed.serial());
            tracing::debug!(peer_id = closed.peer_id(), "connection removed from live set");
        });
        if let Err(err) = started {
            tracing::warn!(peer_id = conn.peer_id(), error = %err, "failed to start reader loop");
            ctx.connections.remove(conn.serial());
            conn.dispose(ctx.join_timeout);
            continue;
        }

        let notified = panic::catch_unwind(AssertUnwindSafe(|| {
            for callback in ctx.callbacks.iter() {
                callback(&*conn);
            }
        }));
        if notified.is_err() {
            break Err(IpcError::AcceptorFault(
                "on-connect callback panicked".to_string(),
            ));
        }
    };

    ctx.accepting.store(false, Ordering::SeqCst);
    match outcome {
        Ok(()) => tracing::info!("acceptor stopped"),
        Err(err) => tracing::error!(error = %err, "acceptor terminated"),
    }
}

/// Collects on-connect callbacks before the aggregator exists.
pub struct AggregatorBuilder {
    config: ServerConfig,
    callbacks: Vec<OnConnect>,
}

impl AggregatorBuilder {
    /// Run `callback` for every newly authorized peer, e.g. to push an
    /// initial state snapshot to it.
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeerConnection) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn build(self) -> Aggregator {
        let mut aggregator = Aggregator::new(self.config);
        aggregator.callbacks = self.callbacks;
        aggregator
    }
}

/// Multiplexes every peer's inbound lines into one queue and broadcasts
/// outbound lines to all of them.
pub struct Aggregator {
    config: ServerConfig,
    scope: CancellationScope,
    inbox: SharedInbox,
    connections: Arc<ConnectionSet>,
    callbacks: Vec<OnConnect>,
    acceptor: Mutex<Option<WorkerHandle>>,
    /// Connects to our own socket on cancel so `accept()` returns.
    wake_acceptor: Option<CancelGuard>,
    accepting: Arc<AtomicBool>,
    started: bool,
    disposed: AtomicBool,
}

impl Aggregator {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            scope: CancellationScope::new(),
            inbox: Arc::new(MessageQueue::new()),
            connections: Arc::new(ConnectionSet::new()),
            callbacks: Vec::new(),
            acceptor: Mutex::new(None),
            wake_acceptor: None,
            accepting: Arc::new(AtomicBool::new(false)),
            started: false,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn builder(config: ServerConfig) -> AggregatorBuilder {
        AggregatorBuilder {
            config,
            callbacks: Vec::new(),
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.config.address
    }

    /// Add an on-connect callback. Only allowed before [`start`](Self::start).
    pub fn register_on_connection_action<F>(&mut self, callback: F) -> IpcResult<()>
    where
        F: Fn(&PeerConnection) + Send + Sync + 'static,
    {
        if self.started {
            return Err(IpcError::InvalidState(
                "callbacks must be registered before start",
            ));
        }
        self.callbacks.push(Arc::new(callback));
        Ok(())
    }

    /// Bind the endpoint and launch the acceptor thread.
    pub fn start(&mut self) -> IpcResult<()> {
        if self.started {
            return Err(IpcError::InvalidState("aggregator already started"));
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(IpcError::InvalidState("aggregator disposed"));
        }
        let listener = net::bind(&self.config.address)?;
        self.started = true;
        self.accepting.store(true, Ordering::SeqCst);

        let ctx = AcceptContext {
            scope: self.scope.clone(),
            inbox: self.inbox.clone(),
            connections: Arc::clone(&self.connections),
            callbacks: self.callbacks.clone().into(),
            handshake_timeout: self.config.handshake_timeout,
            join_timeout: self.config.join_timeout,
            accepting: Arc::clone(&self.accepting),
        };

        let span = tracing::info_span!("acceptor", address = %self.config.address);
        let _entered = span.enter();
        let worker = match WorkerHandle::spawn("catpipe-acceptor", move || {
            run_accept_loop(listener, ctx)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                self.accepting.store(false, Ordering::SeqCst);
                net::unlink(&self.config.address);
                return Err(e.into());
            }
        };
        *self.acceptor.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        let wake_path = self.config.address.socket_path();
        self.wake_acceptor = Some(self.scope.on_cancel(move || {
            let _ = UnixStream::connect(&wake_path);
        }));
        tracing::info!(path = %self.config.address.socket_path().display(), "listening");
        Ok(())
    }

    /// Whether the acceptor thread is still taking new peers.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Next inbound message with the id of the peer that sent it. Blocks
    /// until one arrives; after [`dispose`](Self::dispose) it returns
    /// [`IpcError::QueueClosed`] once the backlog is drained.
    pub fn read_message(&self) -> IpcResult<InboundMessage> {
        self.inbox.pop()
    }

    /// Next inbound text, peer id dropped.
    pub fn read(&self) -> IpcResult<String> {
        self.read_message().map(|m| m.text)
    }

    /// Bounded variant of [`read_message`](Self::read_message).
    pub fn read_timeout(&self, timeout: Duration) -> IpcResult<Option<InboundMessage>> {
        self.inbox.pop_timeout(timeout)
    }

    /// Send `text` to every connection live at call time. Returns how many
    /// peers it was written to; failed peers are closed and skipped.
    pub fn write(&self, text: &str) -> usize {
        let mut delivered = 0;
        for conn in self.connections.snapshot() {
            match conn.send(text) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(peer_id = conn.peer_id(), error = %err, "broadcast to peer failed")
                }
            }
        }
        tracing::debug!(delivered, "broadcast");
        delivered
    }

    /// Send `text` to every live connection authorized as `peer_id`.
    /// Like [`write`](Self::write), a failed connection is closed and
    /// skipped; the count covers the ones that took the line.
    pub fn send_to(&self, peer_id: PeerId, text: &str) -> usize {
        let mut delivered = 0;
        for conn in self.connections.snapshot() {
            if conn.peer_id() != peer_id {
                continue;
            }
            match conn.send(text) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(peer_id, serial = conn.serial(), error = %err, "direct send failed")
                }
            }
        }
        delivered
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .snapshot()
            .iter()
            .map(|c| c.peer_id())
            .collect()
    }

    /// Shut the session down: complete the inbox, raise the cancellation
    /// scope, stop the acceptor, then dispose every connection.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inbox.complete();
        self.scope.cancel();

        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            acceptor.join_timeout(self.config.join_timeout);
            net::unlink(&self.config.address);
        }

        let connections = self.connections.drain();
        let count = connections.len();
        for conn in connections {
            conn.dispose(self.config.join_timeout);
        }
        tracing::info!(connections = count, "aggregator disposed");
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.dispose();
    }
}
