//! Local transport: Unix-domain sockets carrying newline-terminated UTF-8.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};

use crate::config::EndpointAddress;
use crate::error::{IpcError, IpcResult};

/// Bind the server end of `address`.
///
/// A socket file left behind by a dead server is removed first; one that
/// still accepts connections makes the bind fail with `AddrInUse`. Any
/// other kind of file at the path is left alone and rejected.
pub fn bind(address: &EndpointAddress) -> IpcResult<UnixListener> {
    let path = address.socket_path();
    match fs::symlink_metadata(&path) {
        Ok(meta) if !meta.file_type().is_socket() => {
            return Err(IpcError::InvalidAddress(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Ok(_) => {
            if UnixStream::connect(&path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already served", path.display()),
                )
                .into());
            }
            tracing::debug!(path = %path.display(), "removing stale socket file");
            fs::remove_file(&path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(&path)?)
}

pub fn connect(address: &EndpointAddress) -> io::Result<UnixStream> {
    UnixStream::connect(address.socket_path())
}

/// Remove the socket file of `address`, ignoring a missing file.
pub fn unlink(address: &EndpointAddress) {
    let path = address.socket_path();
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file"),
    }
}

/// Write one line. The newline terminator is appended here.
pub fn write_line<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame)?;
    writer.flush()
}

/// Shut both directions down so blocked readers and writers return.
pub fn shutdown(stream: &UnixStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::trace!(error = %e, "socket shutdown failed");
        }
    }
}

/// Buffered line reader over the read half of a stream.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: io::Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    /// Read the next line without its terminator (`\n` or `\r\n`).
    /// End of stream yields [`IpcError::StreamEnded`]; invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn read_line(&mut self) -> IpcResult<String> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Err(IpcError::StreamEnded);
        }
        Ok(self.finish_line())
    }

    /// Like [`read_line`](Self::read_line), for lines of at most `limit`
    /// bytes. `before_read` runs ahead of every refill of the buffer and
    /// may abort the read, e.g. to enforce a deadline.
    pub fn read_line_bounded<F>(&mut self, limit: usize, mut before_read: F) -> IpcResult<String>
    where
        F: FnMut() -> IpcResult<()>,
    {
        self.buf.clear();
        loop {
            before_read()?;
            let chunk = match self.inner.fill_buf() {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if chunk.is_empty() {
                if self.buf.is_empty() {
                    return Err(IpcError::StreamEnded);
                }
                break;
            }
            let (used, complete) = match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (chunk.len(), false),
            };
            // +2 leaves room for the terminator
            if self.buf.len() + used > limit + 2 {
                return Err(IpcError::LineTooLong { limit });
            }
            self.buf.extend_from_slice(&chunk[..used]);
            self.inner.consume(used);
            if complete {
                break;
            }
        }
        let line = self.finish_line();
        if line.len() > limit {
            return Err(IpcError::LineTooLong { limit });
        }
        Ok(line)
    }

    fn finish_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}
