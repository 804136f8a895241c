//! catpipe - local message aggregation over a named endpoint.
//!
//! A server-side [`Aggregator`] accepts any number of peers on one
//! well-known address, authenticates each with a one-line handshake
//! (`auth_<pid>` → `AUTHORIZED` / `NOT AUTHORIZED`), merges their inbound
//! lines into a single queue and broadcasts outbound lines to all of them.
//! [`ClientEndpoint`] is the matching peer side.
//!
//! Every long-lived loop runs on its own thread. One
//! [`CancellationScope`] per session unblocks accepts, reads and queue pops
//! on shutdown.

pub mod auth;
pub mod cancel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod net;
pub mod queue;
pub mod server;
pub mod types;

pub use cancel::{CancelGuard, CancellationScope};
pub use client::{ClientEndpoint, ClientSession};
pub use config::{ClientConfig, EndpointAddress, ServerConfig, DEFAULT_ADDRESS};
pub use connection::{ConnectionState, PeerConnection};
pub use error::{IpcError, IpcResult};
pub use queue::MessageQueue;
pub use server::{Aggregator, AggregatorBuilder, ConnectionSet};
pub use types::{InboundMessage, PeerId, UNSET_PEER_ID};
