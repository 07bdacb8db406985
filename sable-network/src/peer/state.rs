//! Per-peer session state, owned by the node's event loop.

use std::time::Instant;

use indexmap::IndexSet;
use tokio::sync::mpsc;
use tracing::trace;

use sable_chain::block;

use super::{Link, PeerId};
use crate::bloom::BloomFilter;
use crate::constants::{KNOWN_ADDRESSES_LIMIT, KNOWN_INVENTORY_LIMIT};
use crate::protocol::external::types::{PeerServices, ProtocolVersion};
use crate::protocol::external::{InventoryHash, Message};

/// Where a session is in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    /// Connected; `version`/`verack` not yet exchanged in both directions.
    Handshaking,
    /// Fully negotiated; general messages flow.
    Ready,
}

/// The state half of a peer session.
///
/// The IO half lives in the connection task; this struct holds everything
/// the filters read and update, and the outbox handle used to push
/// messages. It is only ever touched from the event loop.
pub struct PeerState {
    /// The remote endpoint.
    pub addr: PeerId,
    /// Whether we dialed the peer or it dialed us.
    pub link: Link,

    /// The negotiated protocol version; zero until `version` is received.
    pub version: ProtocolVersion,
    /// The services the peer advertised.
    pub services: PeerServices,
    /// The peer's advertised user agent.
    pub user_agent: String,
    /// The best-block height the peer advertised in its handshake.
    pub start_height: block::Height,
    /// Whether the peer asked for transaction relay (BIP 37).
    pub relay_txes: bool,

    /// The peer's loaded bloom filter, if any.
    pub filter: Option<BloomFilter>,

    /// Whether a `version` message has been received.
    pub version_received: bool,
    /// Whether a `verack` message has been received.
    pub verack_received: bool,

    /// When the connection was established.
    pub connected_at: Instant,
    /// When traffic was last received from the peer.
    pub last_recv: Instant,
    /// When a message was last pushed to the peer.
    pub last_send: Instant,

    /// Inventory this peer is known to have, advertised in either
    /// direction; bounded, oldest evicted first.
    known_inventory: IndexSet<InventoryHash>,
    /// Endpoints this peer is known to have; bounded like the inventory
    /// set.
    known_addresses: IndexSet<PeerId>,
    /// Alert hashes already exchanged with this peer.
    known_alerts: IndexSet<[u8; 32]>,

    /// The sending side of the connection task's outbox.
    outbox: mpsc::UnboundedSender<Message>,
}

impl PeerState {
    pub fn new(
        addr: PeerId,
        link: Link,
        relay_default: bool,
        outbox: mpsc::UnboundedSender<Message>,
    ) -> PeerState {
        let now = Instant::now();
        PeerState {
            addr,
            link,
            version: ProtocolVersion::unknown(),
            services: PeerServices::empty(),
            user_agent: String::new(),
            start_height: block::Height(0),
            relay_txes: relay_default,
            filter: None,
            version_received: false,
            verack_received: false,
            connected_at: now,
            last_recv: now,
            last_send: now,
            known_inventory: IndexSet::new(),
            known_addresses: IndexSet::new(),
            known_alerts: IndexSet::new(),
            outbox,
        }
    }

    pub fn inbound(&self) -> bool {
        !self.link.is_outbound()
    }

    /// The session is ready once `version` and `verack` have both arrived.
    pub fn handshake_state(&self) -> HandshakeState {
        if self.version_received && self.verack_received {
            HandshakeState::Ready
        } else {
            HandshakeState::Handshaking
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handshake_state() == HandshakeState::Ready
    }

    /// Frame and enqueue an outgoing message, preserving push order.
    ///
    /// Sends are at-most-once per call: if the connection task is gone the
    /// message is dropped and the session will be reaped by the close
    /// event already in flight.
    pub fn push_message(&mut self, message: Message) {
        trace!(peer = %self.addr, %message, "queueing message");
        self.last_send = Instant::now();
        if self.outbox.send(message).is_err() {
            trace!(peer = %self.addr, "outbox closed, dropping message");
        }
    }

    /// Record that the peer knows `inv`. Returns false if it was already
    /// known.
    pub fn record_inventory(&mut self, inv: InventoryHash) -> bool {
        let fresh = self.known_inventory.insert(inv);
        if self.known_inventory.len() > KNOWN_INVENTORY_LIMIT {
            self.known_inventory.shift_remove_index(0);
        }
        fresh
    }

    pub fn knows_inventory(&self, inv: &InventoryHash) -> bool {
        self.known_inventory.contains(inv)
    }

    /// Record that the peer knows `addr`. Returns false if it was already
    /// known.
    pub fn record_address(&mut self, addr: PeerId) -> bool {
        let fresh = self.known_addresses.insert(addr);
        if self.known_addresses.len() > KNOWN_ADDRESSES_LIMIT {
            self.known_addresses.shift_remove_index(0);
        }
        fresh
    }

    /// Record that the peer knows the alert with `hash`. Returns false if
    /// it was already known.
    pub fn record_alert(&mut self, hash: [u8; 32]) -> bool {
        let fresh = self.known_alerts.insert(hash);
        if self.known_alerts.len() > KNOWN_INVENTORY_LIMIT {
            self.known_alerts.shift_remove_index(0);
        }
        fresh
    }

    /// Note received traffic for the inactivity timers.
    pub fn touch_recv(&mut self) {
        self.last_recv = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_chain::transaction;

    fn peer_state() -> (PeerState, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = PeerState::new("203.0.113.9:8333".parse().unwrap(), Link::Outbound, true, tx);
        (state, rx)
    }

    #[test]
    fn handshake_requires_both_messages() {
        let (mut state, _rx) = peer_state();
        assert_eq!(state.handshake_state(), HandshakeState::Handshaking);
        state.version_received = true;
        assert_eq!(state.handshake_state(), HandshakeState::Handshaking);
        state.verack_received = true;
        assert_eq!(state.handshake_state(), HandshakeState::Ready);
    }

    #[test]
    fn push_message_preserves_order() {
        let (mut state, mut rx) = peer_state();
        state.push_message(Message::GetAddr);
        state.push_message(Message::Verack);

        let first = futures::executor::block_on(rx.recv());
        let second = futures::executor::block_on(rx.recv());
        assert!(matches!(first, Some(Message::GetAddr)));
        assert!(matches!(second, Some(Message::Verack)));
    }

    #[test]
    fn known_inventory_is_bounded() {
        let (mut state, _rx) = peer_state();
        for counter in 0..(KNOWN_INVENTORY_LIMIT + 10) {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(counter as u64).to_le_bytes());
            let inv = InventoryHash::Tx(transaction::Hash(bytes));
            assert!(state.record_inventory(inv));
            assert!(!state.record_inventory(inv));
        }

        // The oldest entries were evicted to hold the bound.
        let mut oldest = [0u8; 32];
        oldest[..8].copy_from_slice(&0u64.to_le_bytes());
        assert!(!state.knows_inventory(&InventoryHash::Tx(transaction::Hash(oldest))));
    }
}
