//! Server-side view of one peer.
//!
//! ```text
//! Created -> AwaitingConnection -> Connected -> Authenticating -> Authorized -> Streaming -> Closed
//!                                                     \-> Rejected
//! ```
//!
//! The acceptor drives a connection up to `Authorized`; from then on the
//! connection's own reader thread owns the read half and pushes every line
//! into the shared inbox until the peer hangs up or the session is
//! cancelled.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use crate::auth;
use crate::cancel::{CancelGuard, CancellationScope, WorkerHandle};
use crate::error::{IpcError, IpcResult};
use crate::net::{self, LineReader};
use crate::types::{InboundMessage, PeerId, SharedInbox, UNSET_PEER_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    AwaitingConnection,
    Connected,
    Authenticating,
    Authorized,
    Streaming,
    Rejected,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Closed)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PeerConnection {
    serial: u64,
    peer_id: OnceLock<PeerId>,
    state: Mutex<ConnectionState>,
    /// Write half; `None` until connected and again once closed.
    writer: Mutex<Option<UnixStream>>,
    /// Read half, parked here between accept and the reader loop.
    pending_reader: Mutex<Option<LineReader<UnixStream>>>,
    reader_loop: Mutex<Option<WorkerHandle>>,
    unblock: Mutex<Option<CancelGuard>>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("serial", &self.serial)
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .finish()
    }
}

impl PeerConnection {
    /// `serial` distinguishes connections even when two peers announce the
    /// same id.
    pub fn new(serial: u64) -> Self {
        Self {
            serial,
            peer_id: OnceLock::new(),
            state: Mutex::new(ConnectionState::Created),
            writer: Mutex::new(None),
            pending_reader: Mutex::new(None),
            reader_loop: Mutex::new(None),
            unblock: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The authorized peer id, or [`UNSET_PEER_ID`] before authorization.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id.get().copied().unwrap_or(UNSET_PEER_ID)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_authorized(&self) -> bool {
        self.peer_id.get().is_some()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Block until a peer attaches to `listener`. Cancellation releases
    /// the wait with [`IpcError::Cancelled`]; the acceptor arranges for the
    /// listener to be woken when the scope is raised.
    ///
    /// If the accepted stream cannot be set up, the stream is dropped and
    /// the connection ends `Closed`; the listener stays usable.
    pub fn wait_for_connection(
        &self,
        listener: &UnixListener,
        scope: &CancellationScope,
    ) -> IpcResult<()> {
        self.set_state(ConnectionState::AwaitingConnection);
        let (stream, _) = listener.accept()?;
        if scope.is_cancelled() {
            self.set_state(ConnectionState::Closed);
            return Err(IpcError::Cancelled);
        }
        if let Err(err) = self.attach(stream, scope) {
            self.set_state(ConnectionState::Closed);
            return Err(err);
        }
        Ok(())
    }

    /// Adopt an already connected stream.
    pub fn attach(&self, stream: UnixStream, scope: &CancellationScope) -> IpcResult<()> {
        let read_half = stream.try_clone()?;
        let unblock_half = stream.try_clone()?;
        *lock(&self.pending_reader) = Some(LineReader::new(read_half));
        *lock(&self.writer) = Some(stream);
        *lock(&self.unblock) = Some(scope.on_cancel(move || net::shutdown(&unblock_half)));
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Run the handshake once. On failure the connection is `Rejected`
    /// and its transport already released.
    pub fn authenticate(&self, timeout: Duration) -> IpcResult<PeerId> {
        self.set_state(ConnectionState::Authenticating);
        let outcome = self.run_handshake(timeout);
        match outcome {
            Ok(peer_id) => {
                // first and only assignment
                let _ = self.peer_id.set(peer_id);
                self.set_state(ConnectionState::Authorized);
                tracing::info!(peer_id, serial = self.serial, "peer authorized");
                Ok(peer_id)
            }
            Err(err) => {
                tracing::warn!(serial = self.serial, error = %err, "peer rejected");
                self.set_state(ConnectionState::Rejected);
                self.release_transport();
                Err(err)
            }
        }
    }

    fn run_handshake(&self, timeout: Duration) -> IpcResult<PeerId> {
        let mut reader = lock(&self.pending_reader)
            .take()
            .ok_or(IpcError::InvalidState("handshake before connect"))?;
        let mut writer = lock(&self.writer)
            .as_ref()
            .ok_or(IpcError::InvalidState("handshake before connect"))?
            .try_clone()?;
        let peer_id = auth::accept_handshake(&mut reader, &mut writer, timeout)?;
        *lock(&self.pending_reader) = Some(reader);
        Ok(peer_id)
    }

    /// Start the reader loop. Each line is pushed into `inbox` tagged with
    /// this connection's peer id; `on_closed` runs once the loop ends.
    pub fn start_streaming<F>(self: &Arc<Self>, inbox: SharedInbox, on_closed: F) -> IpcResult<()>
    where
        F: FnOnce(&PeerConnection) + Send + 'static,
    {
        let peer_id = *self
            .peer_id
            .get()
            .ok_or(IpcError::InvalidState("streaming before authorization"))?;
        let reader = lock(&self.pending_reader)
            .take()
            .ok_or(IpcError::InvalidState("reader already started"))?;
        self.set_state(ConnectionState::Streaming);

        let conn = Arc::clone(self);
        let span = tracing::info_span!("peer", peer_id, serial = self.serial);
        let _entered = span.enter();
        let worker = WorkerHandle::spawn(format!("catpipe-peer-{peer_id}"), move || {
            run_reader_loop(reader, peer_id, &inbox);
            conn.release_transport();
            conn.set_state(ConnectionState::Closed);
            on_closed(&*conn);
        })?;
        *lock(&self.reader_loop) = Some(worker);
        Ok(())
    }

    /// Write one line to the peer. Before a peer is connected, and after
    /// the connection closed, this is a no-op.
    pub fn send(&self, text: &str) -> IpcResult<()> {
        let mut writer = lock(&self.writer);
        let Some(stream) = writer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = net::write_line(stream, text) {
            // the reader loop notices the shutdown and closes the connection
            net::shutdown(stream);
            return Err(e.into());
        }
        Ok(())
    }

    fn release_transport(&self) {
        lock(&self.unblock).take();
        lock(&self.pending_reader).take();
        if let Some(stream) = lock(&self.writer).take() {
            net::shutdown(&stream);
        }
    }

    /// Stop the reader loop (waiting at most `join_timeout`), then release
    /// the transport. Safe to call more than once.
    pub fn dispose(&self, join_timeout: Duration) {
        if let Some(stream) = lock(&self.writer).as_ref() {
            net::shutdown(stream);
        }
        let worker = lock(&self.reader_loop).take();
        if let Some(worker) = worker {
            worker.join_timeout(join_timeout);
        }
        self.release_transport();
        let mut state = lock(&self.state);
        if *state != ConnectionState::Rejected {
            *state = ConnectionState::Closed;
        }
    }
}

fn run_reader_loop(mut reader: LineReader<UnixStream>, peer_id: PeerId, inbox: &SharedInbox) {
    loop {
        match reader.read_line() {
            Ok(text) => {
                tracing::trace!(bytes = text.len(), "line received");
                if inbox.push(InboundMessage::new(peer_id, text)).is_err() {
                    tracing::debug!("inbox completed, stopping reader");
                    break;
                }
            }
            Err(IpcError::StreamEnded) => {
                tracing::info!("peer disconnected");
                break;
            }
            Err(err) if err.is_disconnect() => {
                tracing::info!(error = %err, "peer connection dropped");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "transport fault, closing connection");
                break;
            }
        }
    }
}
