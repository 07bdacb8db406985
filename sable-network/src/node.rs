//! The node: one event loop composing the acceptor, the outbound dialer,
//! the filter chain, the peer manager, and the block-chain collaborator.
//!
//! Every piece of peer, filter, and gossip state is owned by this loop.
//! Connection tasks only frame bytes; timers, dials, and all message
//! processing are serialized here, so none of it needs a lock.

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use sable_chain::block::Block;
use sable_chain::chain::ChainAdapter;

use crate::address_book::AddressBook;
use crate::config::Config;
use crate::constants::{
    self, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT, INACTIVITY_TIMEOUT, SWEEP_INTERVAL,
};
use crate::filters::{
    AlertFilter, BlockFilter, EndpointFilter, FilterChain, FilterContext, FilterHandler,
    VersionFilter,
};
use crate::meta_addr::MetaAddr;
use crate::peer::{
    spawn_connection, DisconnectReason, Link, PeerEvent, PeerId, PeerState,
};
use crate::peer_manager::PeerManager;
use crate::protocol::external::message::Version;
use crate::protocol::external::types::{Nonce, PeerServices};
use crate::protocol::external::{InventoryHash, Message};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests a running node to stop.
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Initiate shutdown. The node closes every peer and returns from
    /// [`Node::run`].
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

/// A peer-to-peer node.
pub struct Node {
    config: Config,
    chain: Box<dyn ChainAdapter + Send>,

    peers: PeerManager,
    address_book: AddressBook,

    /// The node's self-nonce, sent in `version` messages and used by the
    /// version filter to detect loopback connections.
    nonce: Nonce,
    services: PeerServices,

    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    shutdown_rx: Option<watch::Receiver<bool>>,

    /// Dials in flight, so upkeep doesn't over-connect.
    pending_dials: HashSet<PeerId>,

    /// Subscribers installed into the block filter at startup.
    block_listeners: Vec<Box<dyn FnMut(&Block) + Send>>,
}

impl Node {
    pub fn new(config: Config, chain: Box<dyn ChainAdapter + Send>) -> (Node, ShutdownHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let total_estimate = chain.total_blocks_estimate();

        let node = Node {
            config,
            chain,
            peers: PeerManager::new(total_estimate),
            address_book: AddressBook::new(),
            nonce: Nonce::default(),
            services: PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
            events_tx,
            events_rx: Some(events_rx),
            shutdown_rx: Some(shutdown_rx),
            pending_dials: HashSet::new(),
            block_listeners: Vec::new(),
        };
        (node, ShutdownHandle { sender: shutdown_tx })
    }

    /// Register a callback invoked for every newly accepted block.
    /// Effective once [`Node::run`] starts.
    pub fn subscribe_blocks(&mut self, listener: Box<dyn FnMut(&Block) + Send>) {
        self.block_listeners.push(listener);
    }

    fn build_filters(&mut self) -> FilterChain {
        let alert_key = if self.config.alert_key.is_empty() {
            None
        } else {
            match hex::decode(&self.config.alert_key)
                .ok()
                .and_then(|bytes| secp256k1::PublicKey::from_slice(&bytes).ok())
            {
                Some(key) => Some(key),
                None => {
                    warn!("configured alert key does not parse, alerts disabled");
                    None
                }
            }
        };

        let mut block_filter = BlockFilter::new();
        for listener in self.block_listeners.drain(..) {
            block_filter.subscribe(listener);
        }

        let mut filters = FilterChain::new();
        filters.install(Box::new(VersionFilter::new(
            self.nonce,
            self.config.user_agent.clone(),
            self.services,
            self.config.relay,
        )));
        filters.install(Box::new(EndpointFilter::new()));
        filters.install(Box::new(AlertFilter::new(
            alert_key,
            constants::CURRENT_VERSION,
            self.config.user_agent.clone(),
        )));
        filters.install(Box::new(block_filter));
        filters.install(Box::new(FilterHandler::new()));
        filters
    }

    /// Run the node until a shutdown is requested.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            addr = %self.config.listen_addr,
            network = %self.config.network,
            "listening for peers"
        );

        let mut filters = self.build_filters();
        let mut events_rx = self
            .events_rx
            .take()
            .expect("run is called exactly once per node");
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .expect("run is called exactly once per node");
        let mut sweep = time::interval(SWEEP_INTERVAL);

        // Seed the endpoint pool so the dialer has somewhere to start.
        for addr in self.config.initial_peers.clone() {
            self.address_book
                .update(MetaAddr::new(addr, PeerServices::NODE_NETWORK, chrono::Utc::now()));
        }
        self.maintain_outbound();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted inbound connection");
                        spawn_connection(
                            stream,
                            Link::Inbound,
                            self.config.network,
                            self.events_tx.clone(),
                        );
                    }
                    Err(error) => warn!(%error, "accept failed"),
                },
                maybe_event = events_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(&mut filters, event),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        info!("shutting down, closing all peers");
        let ids: Vec<PeerId> = self.peers.iter().map(|peer| peer.addr).collect();
        for id in ids {
            self.peers.stop(&id);
        }
        Ok(())
    }

    fn handle_event(&mut self, filters: &mut FilterChain, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer, link, outbox } => {
                self.pending_dials.remove(&peer);
                let state = PeerState::new(peer, link, self.config.relay, outbox);
                self.peers.start(state);

                // We dialed, so we speak first.
                if link.is_outbound() {
                    let version = Version::new(
                        constants::CURRENT_VERSION,
                        peer,
                        PeerServices::NODE_NETWORK,
                        self.services,
                        self.config.listen_addr,
                        self.nonce,
                        self.config.user_agent.clone(),
                        self.chain.best_height(),
                        self.config.relay,
                    );
                    if let Some(state) = self.peers.get_mut(&peer) {
                        state.push_message(Message::Version(version));
                    }
                }
            }
            PeerEvent::Message { peer, message } => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.touch_recv();
                } else {
                    // Already reaped; late messages are dropped.
                    return;
                }
                let mut ctx = FilterContext {
                    peers: &mut self.peers,
                    chain: self.chain.as_mut(),
                    address_book: &mut self.address_book,
                };
                match filters.handle_message(&mut ctx, peer, &message) {
                    Ok(handled) => {
                        if !handled {
                            debug!(%peer, command = %message.command(), "message had no handler");
                        }
                    }
                    Err(reason) => self.close_peer(peer, reason),
                }
            }
            PeerEvent::Closed { peer, reason } => {
                if self.peers.stop(&peer).is_some() {
                    info!(%peer, %reason, "peer connection closed");
                }
                self.maintain_outbound();
            }
            PeerEvent::DialFailed { addr, error } => {
                debug!(%addr, %error, "outbound dial failed");
                self.pending_dials.remove(&addr);
                self.maintain_outbound();
            }
        }
    }

    fn close_peer(&mut self, peer: PeerId, reason: DisconnectReason) {
        // Dropping the session's outbox makes the connection task exit.
        if self.peers.stop(&peer).is_some() {
            info!(%peer, %reason, "dropping peer");
        }
        self.maintain_outbound();
    }

    /// Periodic upkeep: handshake and inactivity timeouts, overdue fetch
    /// retries, and outbound connection targets.
    fn sweep(&mut self) {
        let now = Instant::now();

        let mut to_close: Vec<(PeerId, DisconnectReason)> = Vec::new();
        for peer in self.peers.iter() {
            if !peer.is_ready() && now.duration_since(peer.connected_at) > HANDSHAKE_TIMEOUT {
                to_close.push((peer.addr, DisconnectReason::HandshakeTimeout));
            } else if now.duration_since(peer.last_recv) > INACTIVITY_TIMEOUT {
                to_close.push((peer.addr, DisconnectReason::Inactivity));
            }
        }
        for (peer, reason) in to_close {
            self.close_peer(peer, reason);
        }

        // Re-request inventory whose previous fetch has gone unanswered,
        // preferring a peer that advertised the item.
        for inv in self.peers.due_fetches(now) {
            self.retry_fetch(inv);
        }

        self.maintain_outbound();
    }

    fn retry_fetch(&mut self, inv: InventoryHash) {
        let candidate = self
            .peers
            .iter()
            .filter(|peer| peer.is_ready())
            .find(|peer| peer.knows_inventory(&inv))
            .or_else(|| self.peers.iter().find(|peer| peer.is_ready()))
            .map(|peer| peer.addr);

        match candidate {
            Some(addr) => {
                debug!(?inv, peer = %addr, "retrying overdue fetch");
                self.peers.mark_requested(inv);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.push_message(Message::GetData(vec![inv]));
                }
            }
            None => {
                // No peer to ask; leave the item queued and check again on
                // the next sweep.
                self.peers.mark_requested(inv);
            }
        }
    }

    /// Keep the outbound connection count at its configured target.
    fn maintain_outbound(&mut self) {
        while self.peers.num_outbound() + self.pending_dials.len()
            < self.config.target_outbound_peers
        {
            let peers = &self.peers;
            let pending = &self.pending_dials;
            let candidate = self
                .address_book
                .dial_candidate(|addr| peers.contains(addr) || pending.contains(addr));
            match candidate {
                Some(addr) => self.spawn_dial(addr),
                None => break,
            }
        }
    }

    fn spawn_dial(&mut self, addr: PeerId) {
        debug!(%addr, "dialing outbound peer");
        self.pending_dials.insert(addr);
        let events = self.events_tx.clone();
        let network = self.config.network;
        tokio::spawn(async move {
            match time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => spawn_connection(stream, Link::Outbound, network, events),
                Ok(Err(error)) => {
                    let _ = events.send(PeerEvent::DialFailed {
                        addr,
                        error: error.to_string(),
                    });
                }
                Err(_) => {
                    let _ = events.send(PeerEvent::DialFailed {
                        addr,
                        error: "dial timed out".to_owned(),
                    });
                }
            }
        });
    }
}
