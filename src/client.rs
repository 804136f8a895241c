//! Peer side of a session: connect, authenticate, then run a reader and a
//! writer thread until the server goes away or the scope is cancelled.

use std::io;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Instant;

use crate::auth;
use crate::cancel::CancellationScope;
use crate::config::ClientConfig;
use crate::error::{IpcError, IpcResult};
use crate::net::{self, LineReader};
use crate::queue::MessageQueue;
use crate::types::PeerId;

pub struct ClientEndpoint {
    config: ClientConfig,
    scope: CancellationScope,
}

impl ClientEndpoint {
    pub fn new(config: ClientConfig, scope: CancellationScope) -> Self {
        Self { config, scope }
    }

    /// Connect to the configured address and authenticate.
    ///
    /// While the server socket does not exist yet the attempt is repeated
    /// every `connect_retry_interval`; the pause between attempts ends
    /// early when the scope is cancelled.
    pub fn connect(&self) -> IpcResult<ClientSession> {
        let stream = self.connect_stream()?;
        let mut writer = stream.try_clone()?;
        let mut reader = LineReader::new(stream.try_clone()?);

        // a cancel during the handshake shuts the socket and fails the read
        let unblock = stream.try_clone()?;
        let guard = self.scope.on_cancel(move || net::shutdown(&unblock));
        let outcome = auth::request_authorization(
            &mut reader,
            &mut writer,
            self.config.peer_id,
            self.config.handshake_timeout,
        );
        drop(guard);
        if self.scope.is_cancelled() {
            return Err(IpcError::Cancelled);
        }
        outcome?;

        tracing::info!(
            address = %self.config.address,
            peer_id = self.config.peer_id,
            "connected and authorized"
        );
        Ok(ClientSession {
            stream,
            reader,
            peer_id: self.config.peer_id,
            scope: self.scope.clone(),
        })
    }

    fn connect_stream(&self) -> IpcResult<UnixStream> {
        let started = Instant::now();
        loop {
            if self.scope.is_cancelled() {
                return Err(IpcError::Cancelled);
            }
            match net::connect(&self.config.address) {
                Ok(stream) => return Ok(stream),
                Err(e) if is_not_listening(&e) => {
                    if let Some(limit) = self.config.connect_timeout {
                        if started.elapsed() >= limit {
                            return Err(e.into());
                        }
                    }
                    tracing::trace!(address = %self.config.address, "server not up yet, retrying");
                    if self.scope.wait_timeout(self.config.connect_retry_interval) {
                        return Err(IpcError::Cancelled);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Connect, then run the session until both loops exit.
    pub fn start<F>(&self, outbound: &MessageQueue<String>, on_message: F) -> IpcResult<()>
    where
        F: FnMut(String) + Send,
    {
        self.connect()?.run(outbound, on_message)
    }
}

fn is_not_listening(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// An authorized connection to the server.
pub struct ClientSession {
    stream: UnixStream,
    reader: LineReader<UnixStream>,
    peer_id: PeerId,
    scope: CancellationScope,
}

impl ClientSession {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Run the reader and writer loops on their own threads and return once
    /// both have stopped.
    ///
    /// The reader hands every inbound line to `on_message`; the writer
    /// drains `outbound`. Whenever the reader stops (server hung up, the
    /// scope was cancelled and shut the socket, or `on_message` panicked)
    /// it completes `outbound` and shuts the socket so the writer stops
    /// too. Completing `outbound` from the caller's side ends the session
    /// the same way.
    pub fn run<F>(self, outbound: &MessageQueue<String>, on_message: F) -> IpcResult<()>
    where
        F: FnMut(String) + Send,
    {
        let ClientSession {
            stream,
            reader,
            peer_id,
            scope,
        } = self;
        let span = tracing::info_span!("client", peer_id);
        let _entered = span.enter();

        // cancel -> socket shutdown -> reader sees EOF -> outbound completed
        let unblock = stream.try_clone()?;
        let _guard = scope.on_cancel(move || net::shutdown(&unblock));

        let reader_end = ReaderEnd {
            outbound,
            stream: stream.try_clone()?,
        };

        thread::scope(|s| -> IpcResult<()> {
            let reader_span = span.clone();
            let reader_thread = thread::Builder::new()
                .name(format!("catpipe-client-{peer_id}-reader"))
                .spawn_scoped(s, move || {
                    let _end = reader_end;
                    reader_span.in_scope(|| run_reader_loop(reader, on_message))
                })?;

            let writer_span = span.clone();
            let writer_scope = scope.clone();
            let writer_thread = thread::Builder::new()
                .name(format!("catpipe-client-{peer_id}-writer"))
                .spawn_scoped(s, move || {
                    writer_span.in_scope(|| run_writer_loop(stream, outbound, &writer_scope))
                });
            let writer_thread = match writer_thread {
                Ok(handle) => handle,
                Err(e) => {
                    scope.cancel();
                    let _ = reader_thread.join();
                    return Err(e.into());
                }
            };

            let read_result = reader_thread
                .join()
                .unwrap_or_else(|_| Err(panicked("reader")));
            let write_result = writer_thread
                .join()
                .unwrap_or_else(|_| Err(panicked("writer")));
            tracing::info!("client session ended");
            read_result.and(write_result)
        })
    }
}

/// Ends the writer side once the reader thread is done, unwinding included.
struct ReaderEnd<'a> {
    outbound: &'a MessageQueue<String>,
    stream: UnixStream,
}

impl Drop for ReaderEnd<'_> {
    fn drop(&mut self) {
        self.outbound.complete();
        net::shutdown(&self.stream);
    }
}

fn panicked(which: &str) -> IpcError {
    IpcError::TransportFault(io::Error::other(format!("{which} loop panicked")))
}

fn run_reader_loop<F>(mut reader: LineReader<UnixStream>, mut on_message: F) -> IpcResult<()>
where
    F: FnMut(String),
{
    loop {
        match reader.read_line() {
            Ok(line) => on_message(line),
            Err(IpcError::StreamEnded) => {
                tracing::info!("server closed the connection");
                return Ok(());
            }
            Err(err) if err.is_disconnect() => {
                tracing::info!(error = %err, "connection dropped");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "read failed");
                return Err(err);
            }
        }
    }
}

fn run_writer_loop(
    mut stream: UnixStream,
    outbound: &MessageQueue<String>,
    scope: &CancellationScope,
) -> IpcResult<()> {
    let result = loop {
        let line = match outbound.pop() {
            Ok(line) => line,
            Err(IpcError::QueueClosed) => break Ok(()),
            Err(err) => break Err(err),
        };
        if scope.is_cancelled() {
            break Ok(());
        }
        match net::write_line(&mut stream, &line) {
            Ok(()) => tracing::trace!(bytes = line.len(), "line sent"),
            Err(e) => {
                let err = IpcError::from(e);
                if err.is_disconnect() {
                    break Ok(());
                }
                tracing::warn!(error = %err, "write failed");
                break Err(err);
            }
        }
    };
    // let the reader see the end too
    net::shutdown(&stream);
    result
}
