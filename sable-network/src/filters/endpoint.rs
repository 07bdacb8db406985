//! The address-gossip filter.

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::constants::{
    ADDR_RELAY_FANOUT, ADDR_RELAY_MAX_AGE, BIP31_VERSION, MAX_ADDRS_IN_MESSAGE,
};
use crate::meta_addr::MetaAddr;
use crate::peer::{DisconnectReason, PeerId};
use crate::protocol::external::types::Nonce;
use crate::protocol::external::{Command, Message};

use super::{FilterContext, FilterError, MessageFilter};

/// Maintains the endpoint pool from `addr` gossip, answers `getaddr`, and
/// tracks peer liveness from routine traffic.
#[derive(Default)]
pub struct EndpointFilter {}

const COMMANDS: [Command; 6] = [
    Command::Addr,
    Command::GetAddr,
    Command::Version,
    // these are only handled to update their last activity
    Command::Inv,
    Command::GetData,
    Command::Ping,
];

impl EndpointFilter {
    pub fn new() -> EndpointFilter {
        EndpointFilter {}
    }

    fn handle_addr(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        addrs: &[MetaAddr],
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        if addrs.len() > MAX_ADDRS_IN_MESSAGE {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "oversized addr message",
            )));
        }

        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(ADDR_RELAY_MAX_AGE.as_secs() as i64);
        for meta in addrs {
            if let Some(peer) = ctx.peers.get_mut(&origin) {
                peer.record_address(meta.addr);
            }
            ctx.address_book.update(*meta);

            // Fresh endpoints are echoed to a couple of peers that have
            // not seen them, spreading knowledge of live nodes.
            if meta.last_seen < cutoff {
                continue;
            }
            let mut candidates: Vec<PeerId> = ctx
                .peers
                .iter()
                .filter(|peer| {
                    peer.is_ready() && peer.addr != origin && !peer.addr.eq(&meta.addr)
                })
                .map(|peer| peer.addr)
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            let mut relayed = 0usize;
            for candidate in candidates {
                if relayed == ADDR_RELAY_FANOUT {
                    break;
                }
                let peer = match ctx.peers.get_mut(&candidate) {
                    Some(peer) => peer,
                    None => continue,
                };
                if peer.record_address(meta.addr) {
                    peer.push_message(Message::Addr(vec![*meta]));
                    relayed += 1;
                }
            }
        }
        trace!(%origin, count = addrs.len(), "processed addr gossip");
        Ok(true)
    }

    fn handle_getaddr(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let sample = ctx.address_book.sample(MAX_ADDRS_IN_MESSAGE);
        debug!(%origin, count = sample.len(), "answering getaddr");
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            for meta in &sample {
                peer.record_address(meta.addr);
            }
            if !sample.is_empty() {
                peer.push_message(Message::Addr(sample));
            }
        }
        Ok(true)
    }

    fn handle_ping(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        nonce: Nonce,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        ctx.address_book.touch(origin);
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            // BIP 31 pings carry a nonce and expect it echoed back.
            if peer.version >= BIP31_VERSION && nonce != Nonce(0) {
                peer.push_message(Message::Pong(nonce));
            }
        }
        Ok(true)
    }
}

impl MessageFilter for EndpointFilter {
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
            Message::Addr(addrs) => self.handle_addr(ctx, origin, addrs),
            Message::GetAddr => self.handle_getaddr(ctx, origin),
            Message::Ping(nonce) => self.handle_ping(ctx, origin, *nonce),
            Message::Version(version) => {
                // The origin itself is now a known-good endpoint.
                ctx.address_book.record_connected(origin, version.services);
                Ok(true)
            }
            // Routine traffic refreshes the endpoint's last-seen time; the
            // messages themselves belong to the block filter.
            Message::Inv(_) | Message::GetData(_) => {
                ctx.address_book.touch(origin);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::TestNet;
    use crate::protocol::external::types::PeerServices;

    fn gossip(addr: &str, age_secs: i64) -> MetaAddr {
        MetaAddr::new(
            addr.parse().unwrap(),
            PeerServices::NODE_NETWORK,
            Utc::now() - chrono::Duration::seconds(age_secs),
        )
    }

    #[test]
    fn addr_gossip_fills_the_book_and_relays_fresh_entries() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        let other = net.add_ready_peer();

        let fresh = gossip("198.51.100.7:8333", 30);
        let stale = gossip("198.51.100.8:8333", 3600);
        net.dispatch(origin, &Message::Addr(vec![fresh, stale]))
            .expect("addr gossip accepted");

        assert!(net.address_book.len() >= 3);

        let relayed: Vec<_> = net
            .sent_messages(other)
            .into_iter()
            .filter(|m| matches!(m, Message::Addr(_)))
            .collect();
        // Only the fresh endpoint is relayed.
        assert_eq!(relayed.len(), 1);
        match &relayed[0] {
            Message::Addr(entries) => assert_eq!(entries[0].addr, fresh.addr),
            _ => unreachable!(),
        }
    }

    #[test]
    fn oversized_addr_disconnects() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let oversized = vec![gossip("198.51.100.7:8333", 1); MAX_ADDRS_IN_MESSAGE + 1];
        let result = net.dispatch(origin, &Message::Addr(oversized));
        assert!(matches!(
            result,
            Err(DisconnectReason::PeerMisbehaving(_))
        ));
        assert!(!net.peers.contains(&origin));
    }

    #[test]
    fn getaddr_returns_a_sample() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        net.address_book.update(gossip("198.51.100.9:8333", 10));

        net.dispatch(origin, &Message::GetAddr).unwrap();
        let sent = net.sent_messages(origin);
        assert!(sent.iter().any(|m| matches!(m, Message::Addr(_))));
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        net.dispatch(origin, &Message::Ping(Nonce(0x77))).unwrap();
        let sent = net.sent_messages(origin);
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::Pong(Nonce(0x77)))));
    }
}
