//! Shared types and aliases used across the project to keep signatures concise.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::PeerConnection;
use crate::queue::MessageQueue;

/// Identifier a peer announces during the handshake.
pub type PeerId = i64;

/// Peer id of a connection that has not been authorized yet.
pub const UNSET_PEER_ID: PeerId = -1;

/// One line received from an authorized peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub peer_id: PeerId,
    pub text: String,
}

impl InboundMessage {
    pub fn new(peer_id: PeerId, text: impl Into<String>) -> Self {
        Self {
            peer_id,
            text: text.into(),
        }
    }
}

/// The aggregated inbound queue shared by every connection's reader loop.
pub type SharedInbox = Arc<MessageQueue<InboundMessage>>;

/// Callback run once for every newly authorized connection.
pub type OnConnect = Arc<dyn Fn(&PeerConnection) + Send + Sync>;
