//! Peer sessions: the connection task that frames bytes, and the per-peer
//! state the event loop tracks.

mod connection;
mod state;

use std::net::SocketAddr;

pub use connection::{spawn_connection, PeerEvent};
pub use state::{HandshakeState, PeerState};

/// Identifies a peer by its remote endpoint.
pub type PeerId = SocketAddr;

/// Whether a connection was accepted or dialed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Link {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

impl Link {
    pub fn is_outbound(&self) -> bool {
        matches!(self, Link::Outbound)
    }
}

/// Why a session ended; used for logging and address-book bookkeeping.
#[derive(Clone, Debug)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    ConnectionClosed,
    /// A socket read or write failed.
    Io(String),
    /// The framing codec reported an unrecoverable error.
    Codec(String),
    /// The peer violated the protocol.
    PeerMisbehaving(&'static str),
    /// Connection to self was detected.
    SelfConnection,
    /// The handshake did not complete in time.
    HandshakeTimeout,
    /// No traffic was received within the inactivity window.
    Inactivity,
    /// The node is shutting down.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed by peer"),
            DisconnectReason::Io(e) => write!(f, "i/o error: {}", e),
            DisconnectReason::Codec(e) => write!(f, "framing error: {}", e),
            DisconnectReason::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            DisconnectReason::SelfConnection => write!(f, "detected self-connection"),
            DisconnectReason::HandshakeTimeout => write!(f, "handshake timed out"),
            DisconnectReason::Inactivity => write!(f, "no traffic within the inactivity window"),
            DisconnectReason::Shutdown => write!(f, "node shutting down"),
        }
    }
}
