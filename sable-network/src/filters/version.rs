//! The handshake filter.

use std::cmp::min;

use tracing::{debug, info};

use crate::constants;
use crate::peer::{DisconnectReason, PeerId};
use crate::protocol::external::message::Version;
use crate::protocol::external::types::{Nonce, PeerServices};
use crate::protocol::external::{Command, Message};

use super::{FilterContext, FilterError, MessageFilter};

/// Negotiates the `version`/`verack` handshake and rejects loopback
/// connections.
pub struct VersionFilter {
    /// The node's self-nonce; a `version` carrying it means we dialed
    /// ourselves.
    nonce: Nonce,
    user_agent: String,
    services: PeerServices,
    relay: bool,
}

const COMMANDS: [Command; 2] = [Command::Version, Command::Verack];

impl VersionFilter {
    pub fn new(nonce: Nonce, user_agent: String, services: PeerServices, relay: bool) -> Self {
        VersionFilter {
            nonce,
            user_agent,
            services,
            relay,
        }
    }

    fn handle_version(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        version: &Version,
    ) -> Result<bool, FilterError> {
        // Loopback detection must run before any state is updated.
        if version.nonce == self.nonce {
            debug!(%origin, "version message carries our own nonce");
            return Err(FilterError::Disconnect(DisconnectReason::SelfConnection));
        }

        let best_height = ctx.chain.best_height();
        let peer = match ctx.peers.get_mut(&origin) {
            Some(peer) => peer,
            None => return Ok(false),
        };
        if peer.version_received {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "duplicate version message",
            )));
        }

        peer.version = min(constants::CURRENT_VERSION, version.version);
        peer.services = version.services;
        peer.user_agent = version.user_agent.clone();
        peer.start_height = version.start_height;
        peer.relay_txes = version.relay;
        peer.version_received = true;

        debug!(
            %origin,
            version = %version.version,
            negotiated = %peer.version,
            user_agent = %version.user_agent,
            start_height = %version.start_height,
            "received version"
        );

        // An inbound peer spoke first; answer with our own version.
        if peer.inbound() {
            let reply = Version::new(
                constants::CURRENT_VERSION,
                origin,
                version.services,
                self.services,
                version.address_recv.1,
                self.nonce,
                self.user_agent.clone(),
                best_height,
                self.relay,
            );
            peer.push_message(Message::Version(reply));
        }
        peer.push_message(Message::Verack);
        Ok(true)
    }

    fn handle_verack(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let locator = ctx.chain.locator();
        let peer = match ctx.peers.get_mut(&origin) {
            Some(peer) => peer,
            None => return Ok(false),
        };
        if peer.verack_received {
            // Redundant verack; harmless.
            return Ok(true);
        }
        peer.verack_received = true;
        info!(%origin, version = %peer.version, link = ?peer.link, "peer is ready");

        // Bootstrap gossip and sync now that the session is up.
        if peer.link.is_outbound() {
            peer.push_message(Message::GetAddr);
        }
        peer.push_message(Message::GetBlocks(
            crate::protocol::external::message::GetBlocks {
                block_header_hashes: locator,
                stop_hash: None,
            },
        ));
        Ok(true)
    }
}

impl MessageFilter for VersionFilter {
    fn commands(&self) -> &'static [Command] {
        &COMMANDS
    }

    fn apply(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        message: &Message,
    ) -> Result<bool, FilterError> {
        match message {
            Message::Version(version) => self.handle_version(ctx, origin, version),
            Message::Verack => self.handle_verack(ctx, origin),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::TestNet;

    #[test]
    fn inbound_handshake_replies_with_version_and_verack() {
        sable_test::init();
        let mut net = TestNet::new();
        let peer = net.add_inbound_peer();

        let remote_version = net.remote_version(Nonce(0xBBB), 0);
        net.dispatch(peer, &Message::Version(remote_version))
            .expect("handshake messages are accepted");

        let sent = net.sent_messages(peer);
        assert!(matches!(sent[0], Message::Version(_)));
        assert!(matches!(sent[1], Message::Verack));

        net.dispatch(peer, &Message::Verack).expect("verack accepted");
        assert!(net.peers.get(&peer).unwrap().is_ready());
        // Inbound peers get the initial locator but no getaddr.
        let sent = net.sent_messages(peer);
        assert!(matches!(sent[2], Message::GetBlocks(_)));
    }

    #[test]
    fn outbound_handshake_requests_addresses() {
        sable_test::init();
        let mut net = TestNet::new();
        let peer = net.add_outbound_peer();

        let remote_version = net.remote_version(Nonce(0xBBB), 100);
        net.dispatch(peer, &Message::Version(remote_version)).unwrap();
        net.dispatch(peer, &Message::Verack).unwrap();

        let sent = net.sent_messages(peer);
        // Outbound: we already sent version on connect (outside the
        // filters), so the first filter output is our verack.
        assert!(matches!(sent[0], Message::Verack));
        assert!(matches!(sent[1], Message::GetAddr));
        assert!(matches!(sent[2], Message::GetBlocks(_)));

        // The negotiated version is the minimum of both.
        assert_eq!(
            net.peers.get(&peer).unwrap().version,
            constants::CURRENT_VERSION
        );
    }

    #[test]
    fn self_connection_is_rejected() {
        sable_test::init();
        let mut net = TestNet::new();
        let peer = net.add_outbound_peer();

        let own_nonce = net.self_nonce;
        let version = net.remote_version(own_nonce, 0);
        let result = net.dispatch(peer, &Message::Version(version));
        assert!(matches!(
            result,
            Err(DisconnectReason::SelfConnection)
        ));
    }

    #[test]
    fn non_handshake_messages_before_version_are_dropped() {
        sable_test::init();
        let mut net = TestNet::new();
        let peer = net.add_inbound_peer();

        // getaddr before version: swallowed, peer stays connected.
        let handled = net.dispatch(peer, &Message::GetAddr).unwrap();
        assert!(!handled);
        assert!(net.peers.contains(&peer));
    }
}
