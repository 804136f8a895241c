//! The single-line handshake: `auth_<pid>` answered by `AUTHORIZED` or
//! `NOT AUTHORIZED`. One attempt per connection; a failed attempt always
//! ends with the connection being torn down by the caller.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::error::{IpcError, IpcResult};
use crate::net::{self, LineReader};
use crate::types::PeerId;

pub const AUTH_PREFIX: &str = "auth_";
pub const AUTHORIZED: &str = "AUTHORIZED";
pub const NOT_AUTHORIZED: &str = "NOT AUTHORIZED";

/// Longest handshake line either side accepts, terminator excluded.
pub const MAX_AUTH_LINE: usize = 64;

/// The line a client sends to announce `peer_id`.
pub fn auth_line(peer_id: PeerId) -> String {
    format!("{AUTH_PREFIX}{peer_id}")
}

/// Parse `auth_<n>` where `n` is a non-negative base-10 integer.
pub fn parse_auth_line(line: &str) -> IpcResult<PeerId> {
    let suffix = line
        .strip_prefix(AUTH_PREFIX)
        .ok_or_else(|| IpcError::rejected(format!("missing {AUTH_PREFIX} prefix")))?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IpcError::rejected(format!("{suffix:?} is not a peer id")));
    }
    suffix
        .parse::<PeerId>()
        .map_err(|_| IpcError::rejected(format!("peer id {suffix} is out of range")))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read one line of at most [`MAX_AUTH_LINE`] bytes that has to be
/// complete within `timeout`, however the peer paces its bytes. A timeout,
/// an overlong line or a vanished peer all count as a rejected handshake.
fn read_handshake_line<R: Read>(
    reader: &mut LineReader<R>,
    stream: &UnixStream,
    timeout: Duration,
) -> IpcResult<String> {
    let deadline = Instant::now() + timeout;
    let line = reader.read_line_bounded(MAX_AUTH_LINE, || {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(IpcError::rejected("handshake timed out"));
        }
        stream.set_read_timeout(Some(remaining))?;
        Ok(())
    });
    stream.set_read_timeout(None)?;
    match line {
        Ok(line) => Ok(line),
        Err(IpcError::StreamEnded) => Err(IpcError::rejected("peer closed during handshake")),
        Err(IpcError::LineTooLong { limit }) => Err(IpcError::rejected(format!(
            "handshake line exceeds {limit} bytes"
        ))),
        Err(IpcError::TransportFault(e)) if is_timeout(&e) => {
            Err(IpcError::rejected("handshake timed out"))
        }
        Err(e) => Err(e),
    }
}

/// Server side. Reads the auth line from `reader`, answers on `writer` and
/// returns the announced peer id.
pub fn accept_handshake<R: Read>(
    reader: &mut LineReader<R>,
    writer: &mut UnixStream,
    timeout: Duration,
) -> IpcResult<PeerId> {
    let outcome = read_handshake_line(reader, writer, timeout)
        .and_then(|line| parse_auth_line(&line));
    match outcome {
        Ok(peer_id) => {
            net::write_line(writer, AUTHORIZED)?;
            Ok(peer_id)
        }
        Err(err @ IpcError::HandshakeRejected { .. }) => {
            // the peer may already be gone
            let _ = net::write_line(writer, NOT_AUTHORIZED);
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Client side. Announces `peer_id` and waits for the verdict.
pub fn request_authorization<R: Read>(
    reader: &mut LineReader<R>,
    writer: &mut UnixStream,
    peer_id: PeerId,
    timeout: Duration,
) -> IpcResult<()> {
    net::write_line(writer, &auth_line(peer_id))?;
    let reply = read_handshake_line(reader, writer, timeout)?;
    if reply == AUTHORIZED {
        Ok(())
    } else {
        Err(IpcError::rejected(format!("server replied {reply:?}")))
    }
}
