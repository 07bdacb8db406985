//! A small harness that wires the full filter chain to an in-memory chain
//! state and fake peer sessions, so filter tests can drive real message
//! flows without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::FutureExt;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::sync::mpsc;

use sable_chain::block::{self, merkle, Block, Header, Height};
use sable_chain::chain::ChainAdapter;
use sable_chain::parameters::Network;
use sable_chain::transaction::{LockTime, Transaction};
use sable_chain::transparent::{CoinbaseData, Input, Output, Script};
use sable_chain::work::difficulty::CompactDifficulty;
use sable_chain::Cached;
use sable_state::ChainState;

use crate::address_book::AddressBook;
use crate::constants;
use crate::peer::{DisconnectReason, Link, PeerId, PeerState};
use crate::peer_manager::PeerManager;
use crate::protocol::external::message::Version;
use crate::protocol::external::types::{Nonce, PeerServices};
use crate::protocol::external::Message;

use super::{
    AlertFilter, BlockFilter, EndpointFilter, FilterChain, FilterContext, FilterHandler,
    VersionFilter,
};

pub struct TestNet {
    pub chain: ChainState,
    pub peers: PeerManager,
    pub address_book: AddressBook,
    pub filters: FilterChain,
    pub self_nonce: Nonce,
    outboxes: HashMap<PeerId, mpsc::UnboundedReceiver<Message>>,
    history: HashMap<PeerId, Vec<Message>>,
    next_host: u8,
}

impl TestNet {
    pub fn new() -> TestNet {
        let chain = ChainState::new(Network::Regtest);
        let peers = PeerManager::new(0);
        let self_nonce = Nonce(0xAAAA_5EED);

        let mut filters = FilterChain::new();
        filters.install(Box::new(VersionFilter::new(
            self_nonce,
            constants::USER_AGENT.to_owned(),
            PeerServices::NODE_NETWORK,
            true,
        )));
        filters.install(Box::new(EndpointFilter::new()));
        filters.install(Box::new(AlertFilter::new(
            Some(Self::alert_public_key()),
            constants::CURRENT_VERSION,
            constants::USER_AGENT.to_owned(),
        )));
        filters.install(Box::new(BlockFilter::new()));
        filters.install(Box::new(FilterHandler::new()));

        TestNet {
            chain,
            peers,
            address_book: AddressBook::new(),
            filters,
            self_nonce,
            outboxes: HashMap::new(),
            history: HashMap::new(),
            next_host: 1,
        }
    }

    pub fn alert_secret_key() -> SecretKey {
        SecretKey::from_slice(&[0x42; 32]).expect("a constant key in range")
    }

    pub fn alert_public_key() -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &Self::alert_secret_key())
    }

    fn add_peer(&mut self, link: Link) -> PeerId {
        let addr: PeerId = format!("203.0.113.{}:8333", self.next_host).parse().unwrap();
        self.next_host += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.start(PeerState::new(addr, link, true, tx));
        self.outboxes.insert(addr, rx);
        self.history.insert(addr, Vec::new());
        addr
    }

    pub fn add_inbound_peer(&mut self) -> PeerId {
        self.add_peer(Link::Inbound)
    }

    pub fn add_outbound_peer(&mut self) -> PeerId {
        self.add_peer(Link::Outbound)
    }

    /// Add a peer and complete its handshake directly.
    pub fn add_ready_peer(&mut self) -> PeerId {
        let addr = self.add_inbound_peer();
        let version = self.remote_version(Nonce(addr.ip().to_string().len() as u64), 0);
        self.dispatch(addr, &Message::Version(version))
            .expect("handshake version accepted");
        self.dispatch(addr, &Message::Verack)
            .expect("handshake verack accepted");
        // Clear handshake traffic out of the history for cleaner asserts.
        self.drain(addr);
        self.history.get_mut(&addr).unwrap().clear();
        addr
    }

    /// Run one message through the filter chain, stopping the session on a
    /// disconnect, as the node does.
    pub fn dispatch(
        &mut self,
        origin: PeerId,
        message: &Message,
    ) -> Result<bool, DisconnectReason> {
        let mut ctx = FilterContext {
            peers: &mut self.peers,
            chain: &mut self.chain,
            address_book: &mut self.address_book,
        };
        match self.filters.handle_message(&mut ctx, origin, message) {
            Ok(handled) => Ok(handled),
            Err(reason) => {
                self.peers.stop(&origin);
                Err(reason)
            }
        }
    }

    fn drain(&mut self, peer: PeerId) {
        let rx = self.outboxes.get_mut(&peer).expect("peer was added");
        let history = self.history.get_mut(&peer).expect("peer was added");
        while let Some(Some(message)) = rx.recv().now_or_never() {
            history.push(message);
        }
    }

    /// All messages pushed to `peer` since it was added.
    pub fn sent_messages(&mut self, peer: PeerId) -> Vec<Message> {
        self.drain(peer);
        self.history.get(&peer).expect("peer was added").clone()
    }

    /// A plausible `version` message from a remote peer.
    pub fn remote_version(&self, nonce: Nonce, start_height: u32) -> Version {
        Version::new(
            constants::CURRENT_VERSION,
            "203.0.113.250:8333".parse().unwrap(),
            PeerServices::NODE_NETWORK,
            PeerServices::NODE_NETWORK,
            "203.0.113.251:8333".parse().unwrap(),
            nonce,
            "/peer:0.1/".to_owned(),
            Height(start_height),
            true,
        )
    }

    /// The current best tip hash of the test chain.
    pub fn tip(&self) -> block::Hash {
        let height = self.chain.best_height();
        self.chain
            .blocks_after(&[], None, height.0 as usize + 1)
            .last()
            .copied()
            .unwrap_or_else(|| sable_chain::parameters::genesis_hash(Network::Regtest))
    }
}

fn coinbase_at(tag: u32) -> Arc<Transaction> {
    use std::convert::TryFrom;

    let mut data = vec![0x04];
    data.extend_from_slice(&tag.to_le_bytes());
    Arc::new(Transaction::new(
        1,
        vec![Input::Coinbase {
            height: Some(Cached::from(Height(tag))),
            data: CoinbaseData(data),
            sequence: 0xffff_ffff,
        }],
        vec![Output {
            value: sable_chain::amount::Amount::try_from(5_000_000_000).unwrap(),
            lock_script: Script(vec![0x51]),
        }],
        LockTime::unlocked(),
    ))
}

/// Build a regtest block on `parent`, grinding the nonce until the easy
/// regtest difficulty filter passes.
pub fn mine_child(parent: block::Hash, tag: u32) -> Arc<Block> {
    let transactions = vec![coinbase_at(tag)];
    let merkle_root: merkle::Root = transactions.iter().map(|tx| tx.hash()).collect();
    for nonce in 0.. {
        let header = Header::new(
            1,
            parent,
            merkle_root,
            Utc.timestamp(1_296_688_700 + tag as i64, 0),
            CompactDifficulty(0x207fffff),
            nonce,
        );
        let block = Block {
            header,
            transactions: transactions.clone(),
        };
        let hash = block.hash();
        let threshold = block
            .header
            .difficulty_threshold
            .to_expanded()
            .expect("regtest difficulty expands");
        if hash <= threshold {
            return Arc::new(block);
        }
    }
    unreachable!("some nonce satisfies the regtest difficulty limit")
}
