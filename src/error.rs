//! Error types shared by the server, client and queue.

use std::io;

use thiserror::Error;

/// Every failure the messaging core can report.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Malformed, missing or timed-out `auth_<pid>` line.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    /// The peer closed its side of the transport.
    #[error("stream ended")]
    StreamEnded,

    /// A bounded read gave up before the line ended.
    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: usize },

    /// The queue was completed and fully drained.
    #[error("queue closed")]
    QueueClosed,

    #[error("transport fault: {0}")]
    TransportFault(#[from] io::Error),

    #[error("acceptor fault: {0}")]
    AcceptorFault(String),

    /// A blocking wait was released by the cancellation scope.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type IpcResult<T> = Result<T, IpcError>;

impl IpcError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            reason: reason.into(),
        }
    }

    /// True for the ordinary ways a peer goes away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::StreamEnded => true,
            Self::TransportFault(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
