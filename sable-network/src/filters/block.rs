//! The block and transaction filter: inventory gossip, data serving, chain
//! sync, and the orphan pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tracing::{debug, info, trace, warn};

use sable_chain::block::{self, Block};
use sable_chain::chain::AcceptOutcome;
use sable_chain::transaction::Transaction;

use crate::constants::{
    ALREADY_ASKED_INTERVAL, MAX_GETBLOCKS_RESULTS, MAX_GETHEADERS_RESULTS, MAX_INV_IN_MESSAGE,
    ORPHAN_POOL_LIMIT,
};
use crate::peer::{DisconnectReason, PeerId};
use crate::protocol::external::message::{GetBlocks, GetHeaders, MerkleBlock};
use crate::protocol::external::{Command, InventoryHash, Message};

use super::{FilterContext, FilterError, MessageFilter};

/// Blocks whose parent is not yet known, indexed two ways: by their own
/// hash and by the missing parent's hash, so an arriving ancestor can
/// splice its descendants back in.
#[derive(Default)]
struct OrphanPool {
    /// Insertion-ordered so the oldest orphan is evicted first.
    by_hash: IndexMap<block::Hash, Arc<Block>>,
    by_prev: HashMap<block::Hash, Vec<block::Hash>>,
}

impl OrphanPool {
    fn contains(&self, hash: &block::Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn insert(&mut self, block: Arc<Block>) {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) {
            return;
        }
        self.by_prev
            .entry(block.header.previous_block_hash)
            .or_default()
            .push(hash);
        self.by_hash.insert(hash, block);

        if self.by_hash.len() > ORPHAN_POOL_LIMIT {
            if let Some((evicted_hash, evicted)) = self.by_hash.shift_remove_index(0) {
                let prev = evicted.header.previous_block_hash;
                if let Some(siblings) = self.by_prev.get_mut(&prev) {
                    siblings.retain(|sibling| *sibling != evicted_hash);
                    if siblings.is_empty() {
                        self.by_prev.remove(&prev);
                    }
                }
                debug!(hash = %evicted_hash, "evicted oldest orphan");
            }
        }
        metrics::gauge!("orphans.pooled", self.by_hash.len() as f64);
    }

    /// Remove and return the orphans whose parent is `parent`.
    fn take_children(&mut self, parent: &block::Hash) -> Vec<Arc<Block>> {
        let hashes = self.by_prev.remove(parent).unwrap_or_default();
        hashes
            .into_iter()
            .filter_map(|hash| self.by_hash.shift_remove(&hash))
            .collect()
    }

    /// Walk ancestors while they are also orphans; the terminal hash is
    /// the missing block to request from the network.
    fn orphan_root(&self, hash: &block::Hash) -> block::Hash {
        let mut cursor = *hash;
        while let Some(orphan) = self.by_hash.get(&cursor) {
            cursor = orphan.header.previous_block_hash;
        }
        cursor
    }

    fn len(&self) -> usize {
        self.by_hash.len()
    }
}

/// Handles `block`, `tx`, `inv`, `getdata`, `getblocks` and `getheaders`,
/// and owns the orphan pool.
pub struct BlockFilter {
    orphans: OrphanPool,
    /// Cross-peer rate limit on `getdata` re-requests; the fetch queue in
    /// the peer manager is the canonical schedule.
    already_asked: HashMap<InventoryHash, Instant>,
    /// Subscribers notified for every newly accepted block, in
    /// registration order.
    listeners: Vec<Box<dyn FnMut(&Block) + Send>>,
}

const COMMANDS: [Command; 7] = [
    Command::Block,
    Command::Tx,
    Command::GetBlocks,
    Command::GetHeaders,
    Command::Inv,
    Command::GetData,
    Command::Version,
];

impl BlockFilter {
    pub fn new() -> BlockFilter {
        BlockFilter {
            orphans: OrphanPool::default(),
            already_asked: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Register a callback invoked for every newly accepted block.
    pub fn subscribe(&mut self, listener: Box<dyn FnMut(&Block) + Send>) {
        self.listeners.push(listener);
    }

    fn already_have(&self, ctx: &FilterContext<'_>, inv: &InventoryHash) -> bool {
        match inv {
            InventoryHash::Tx(hash) => ctx.chain.contains_transaction(hash),
            InventoryHash::Block(hash) | InventoryHash::FilteredBlock(hash) => {
                ctx.chain.contains_block(hash) || self.orphans.contains(hash)
            }
            InventoryHash::Error => true,
        }
    }

    fn handle_inv(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        items: &[InventoryHash],
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        if items.len() > MAX_INV_IN_MESSAGE {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "oversized inv message",
            )));
        }

        let now = Instant::now();
        let mut request = Vec::new();
        let mut fetch_roots = Vec::new();

        for item in items {
            if !item.is_known_type() {
                continue;
            }
            if let Some(peer) = ctx.peers.get_mut(&origin) {
                peer.record_inventory(*item);
            }

            if self.already_have(ctx, item) {
                // A block we only hold as an orphan means the peer may have
                // the missing ancestors; chase the root.
                if let InventoryHash::Block(hash) = item {
                    if self.orphans.contains(hash) {
                        fetch_roots.push(self.orphans.orphan_root(hash));
                    }
                }
                continue;
            }

            // The fetch queue decides when this item may next be requested;
            // the already-asked map adds a cross-peer rate limit on top.
            let at = ctx.peers.prioritize(*item);
            let asked_recently = self
                .already_asked
                .get(item)
                .map(|last| now.duration_since(*last) < ALREADY_ASKED_INTERVAL)
                .unwrap_or(false);
            if at <= now && !asked_recently {
                self.already_asked.insert(*item, now);
                ctx.peers.mark_requested(*item);
                request.push(*item);
            }
        }

        let locator = ctx.chain.locator();
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            if !request.is_empty() {
                trace!(%origin, count = request.len(), "requesting advertised inventory");
                peer.push_message(Message::GetData(request));
            }
            for root in fetch_roots {
                debug!(%origin, %root, "requesting blocks up to orphan root");
                peer.push_message(Message::GetBlocks(GetBlocks {
                    block_header_hashes: locator.clone(),
                    stop_hash: Some(root),
                }));
            }
        }
        Ok(true)
    }

    fn handle_getdata(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        items: &[InventoryHash],
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        if items.len() > MAX_INV_IN_MESSAGE {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "oversized getdata message",
            )));
        }

        // Requested items are answered in request order.
        for item in items {
            match item {
                InventoryHash::Tx(hash) => {
                    if let Some(tx) = ctx.chain.get_transaction(hash) {
                        if let Some(peer) = ctx.peers.get_mut(&origin) {
                            peer.push_message(Message::Tx(tx));
                        }
                    }
                }
                InventoryHash::Block(hash) => {
                    if let Some(block) = ctx.chain.get_block(hash) {
                        if let Some(peer) = ctx.peers.get_mut(&origin) {
                            peer.push_message(Message::Block(block));
                        }
                    }
                }
                InventoryHash::FilteredBlock(hash) => {
                    self.serve_filtered_block(ctx, origin, hash);
                }
                InventoryHash::Error => {}
            }
        }
        Ok(true)
    }

    /// Answer a `MSG_FILTERED_BLOCK` getdata entry: a `merkleblock` built
    /// against the peer's bloom filter, followed by the matched
    /// transactions.
    fn serve_filtered_block(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        hash: &block::Hash,
    ) {
        let block = match ctx.chain.get_block(hash) {
            Some(block) => block,
            None => return,
        };
        let peer = match ctx.peers.get_mut(&origin) {
            Some(peer) => peer,
            None => return,
        };
        let filter = match &peer.filter {
            Some(filter) => filter,
            // Without a loaded filter there is nothing sensible to serve.
            None => return,
        };

        let matched: HashSet<_> = block
            .transactions
            .iter()
            .filter(|tx| filter.matches_transaction(tx))
            .map(|tx| tx.hash())
            .collect();
        let merkle_block = MerkleBlock::from_block(&block, &matched);
        peer.push_message(Message::MerkleBlock(merkle_block));
        for tx in &block.transactions {
            if matched.contains(&tx.hash()) {
                peer.push_message(Message::Tx(tx.clone()));
            }
        }
    }

    fn handle_getblocks(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        request: &GetBlocks,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let hashes = ctx.chain.blocks_after(
            &request.block_header_hashes,
            request.stop_hash,
            MAX_GETBLOCKS_RESULTS,
        );
        trace!(%origin, count = hashes.len(), "answering getblocks");
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            if !hashes.is_empty() {
                let inv = hashes.into_iter().map(InventoryHash::Block).collect();
                peer.push_message(Message::Inv(inv));
            }
        }
        Ok(true)
    }

    fn handle_getheaders(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        request: &GetHeaders,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let headers = ctx.chain.headers_after(
            &request.block_header_hashes,
            request.stop_hash,
            MAX_GETHEADERS_RESULTS,
        );
        trace!(%origin, count = headers.len(), "answering getheaders");
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.push_message(Message::Headers(headers));
        }
        Ok(true)
    }

    fn handle_block(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        block: &Arc<Block>,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let hash = block.hash();
        let inv = InventoryHash::Block(hash);
        ctx.peers.dequeue(&inv);
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.record_inventory(inv);
        }

        if self.orphans.contains(&hash) {
            return Ok(true);
        }

        match ctx.chain.accept_block(block.clone()) {
            AcceptOutcome::Accepted => {
                self.block_accepted(ctx, origin, block);
                self.promote_orphans(ctx, origin, hash);
                Ok(true)
            }
            AcceptOutcome::AlreadyHave => Ok(true),
            AcceptOutcome::Orphan => {
                debug!(%hash, pooled = self.orphans.len(), "storing orphan block");
                self.orphans.insert(block.clone());
                let root = self.orphans.orphan_root(&hash);
                let locator = ctx.chain.locator();
                if let Some(peer) = ctx.peers.get_mut(&origin) {
                    peer.push_message(Message::GetBlocks(GetBlocks {
                        block_header_hashes: locator,
                        stop_hash: Some(root),
                    }));
                }
                Ok(true)
            }
            AcceptOutcome::Invalid(reason) => {
                warn!(%origin, %hash, %reason, "peer sent an invalid block");
                Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                    "invalid block",
                )))
            }
        }
    }

    /// Post-acceptance bookkeeping: notify subscribers and advertise the
    /// block to peers that do not know it yet.
    fn block_accepted(&mut self, ctx: &mut FilterContext<'_>, origin: PeerId, block: &Arc<Block>) {
        let hash = block.hash();
        info!(%hash, height = %ctx.chain.best_height(), "accepted block");

        // Observer list; never re-entered during a notification.
        for listener in self.listeners.iter_mut() {
            listener(block);
        }

        let inv = InventoryHash::Block(hash);
        for peer in ctx.peers.ready_peers_mut() {
            if peer.addr != origin && peer.record_inventory(inv) {
                peer.push_message(Message::Inv(vec![inv]));
            }
        }
    }

    /// Accept every pooled descendant of a newly connected block,
    /// breadth-first, splicing whole orphan chains back onto the chain.
    fn promote_orphans(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        accepted: block::Hash,
    ) {
        let mut parents = VecDeque::new();
        parents.push_back(accepted);

        while let Some(parent) = parents.pop_front() {
            for orphan in self.orphans.take_children(&parent) {
                let orphan_hash = orphan.hash();
                ctx.peers.dequeue(&InventoryHash::Block(orphan_hash));
                match ctx.chain.accept_block(orphan.clone()) {
                    AcceptOutcome::Accepted => {
                        debug!(hash = %orphan_hash, "promoted orphan block");
                        self.block_accepted(ctx, origin, &orphan);
                        parents.push_back(orphan_hash);
                    }
                    outcome => {
                        debug!(hash = %orphan_hash, ?outcome, "dropped unpromotable orphan");
                    }
                }
            }
        }
    }

    fn handle_tx(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        transaction: &Arc<Transaction>,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let hash = transaction.hash();
        let inv = InventoryHash::Tx(hash);
        ctx.peers.dequeue(&inv);
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.record_inventory(inv);
        }

        match ctx.chain.accept_transaction(transaction.clone()) {
            AcceptOutcome::Accepted => {
                debug!(%hash, "accepted transaction into the mempool");
                for peer in ctx.peers.ready_peers_mut() {
                    if peer.addr == origin || peer.knows_inventory(&inv) {
                        continue;
                    }
                    // Bloom-filtered peers get matching transactions only;
                    // unfiltered peers opted in (or out) via `relay`.
                    let wanted = match &peer.filter {
                        Some(filter) => filter.matches_transaction(transaction),
                        None => peer.relay_txes,
                    };
                    if wanted {
                        peer.record_inventory(inv);
                        peer.push_message(Message::Inv(vec![inv]));
                    }
                }
                Ok(true)
            }
            AcceptOutcome::AlreadyHave => Ok(true),
            AcceptOutcome::Orphan | AcceptOutcome::Invalid(_) => {
                // Unconnected or invalid loose transactions are routine
                // gossip noise, not grounds for disconnection.
                debug!(%origin, %hash, "ignoring unacceptable transaction");
                Ok(true)
            }
        }
    }
}

impl MessageFilter for BlockFilter {
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
            Message::Inv(items) => self.handle_inv(ctx, origin, items),
            Message::GetData(items) => self.handle_getdata(ctx, origin, items),
            Message::GetBlocks(request) => self.handle_getblocks(ctx, origin, request),
            Message::GetHeaders(request) => self.handle_getheaders(ctx, origin, request),
            Message::Block(block) => self.handle_block(ctx, origin, block),
            Message::Tx(transaction) => self.handle_tx(ctx, origin, transaction),
            Message::Version(version) => {
                // Feed the advertised height into the best-height window.
                ctx.peers.record_peer_height(version.start_height.0);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{mine_child, TestNet};
    use sable_chain::chain::ChainAdapter;
    use sable_chain::parameters::{genesis_hash, Network};

    #[test]
    fn unknown_inventory_is_fetched_once() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        let other = net.add_ready_peer();

        let inv = InventoryHash::Block(block::Hash([0x77; 32]));
        net.dispatch(origin, &Message::Inv(vec![inv])).unwrap();

        let sent = net.sent_messages(origin);
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::GetData(items) if items == &vec![inv])));
        assert!(net.peers.queued(&inv));

        // A second advertisement within the retry window is not
        // re-requested, from either peer.
        net.dispatch(other, &Message::Inv(vec![inv])).unwrap();
        let sent = net.sent_messages(other);
        assert!(!sent.iter().any(|m| matches!(m, Message::GetData(_))));
    }

    #[test]
    fn getdata_is_served_in_request_order() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let genesis = genesis_hash(Network::Regtest);
        let coinbase = net
            .chain
            .get_block(&genesis)
            .unwrap()
            .transactions[0]
            .hash();

        net.dispatch(
            origin,
            &Message::GetData(vec![
                InventoryHash::Tx(coinbase),
                InventoryHash::Block(genesis),
            ]),
        )
        .unwrap();

        let sent = net.sent_messages(origin);
        assert!(matches!(sent[0], Message::Tx(_)));
        assert!(matches!(sent[1], Message::Block(_)));
    }

    #[test]
    fn orphan_chain_is_pooled_and_promoted() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let genesis = genesis_hash(Network::Regtest);
        let b1 = mine_child(genesis, 1);
        let b2 = mine_child(b1.hash(), 2);
        let b3 = mine_child(b2.hash(), 3);

        // Children arrive before their ancestor.
        net.dispatch(origin, &Message::Block(b3.clone())).unwrap();
        net.dispatch(origin, &Message::Block(b2.clone())).unwrap();
        assert_eq!(net.chain.best_height(), block::Height(0));

        // Each orphan triggers a getblocks aimed at its pool's root: b3
        // alone roots at its missing parent b2; once b2 joins the pool the
        // root becomes the still-missing b1.
        let requests: Vec<_> = net
            .sent_messages(origin)
            .into_iter()
            .filter_map(|m| match m {
                Message::GetBlocks(request) => request.stop_hash,
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![b2.hash(), b1.hash()]);

        // The missing ancestor arrives; the whole chain is spliced in.
        net.dispatch(origin, &Message::Block(b1.clone())).unwrap();
        assert_eq!(net.chain.best_height(), block::Height(3));
        assert!(net.chain.contains_block(&b3.hash()));
    }

    #[test]
    fn accepted_blocks_are_advertised_to_other_peers() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        let other = net.add_ready_peer();

        let b1 = mine_child(genesis_hash(Network::Regtest), 1);
        net.dispatch(origin, &Message::Block(b1.clone())).unwrap();

        let inv = InventoryHash::Block(b1.hash());
        let sent = net.sent_messages(other);
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::Inv(items) if items == &vec![inv])));
        // The origin already knows the block and is not re-advertised it.
        let sent = net.sent_messages(origin);
        assert!(!sent
            .iter()
            .any(|m| matches!(m, Message::Inv(items) if items == &vec![inv])));
    }

    #[test]
    fn getblocks_walks_forward_from_the_locator() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let genesis = genesis_hash(Network::Regtest);
        let b1 = mine_child(genesis, 1);
        let b2 = mine_child(b1.hash(), 2);
        net.dispatch(origin, &Message::Block(b1.clone())).unwrap();
        net.dispatch(origin, &Message::Block(b2.clone())).unwrap();

        net.dispatch(
            origin,
            &Message::GetBlocks(GetBlocks {
                block_header_hashes: vec![genesis],
                stop_hash: None,
            }),
        )
        .unwrap();

        let sent = net.sent_messages(origin);
        let inv: Vec<_> = sent
            .iter()
            .filter_map(|m| match m {
                Message::Inv(items) if items.len() == 2 => Some(items.clone()),
                _ => None,
            })
            .next()
            .expect("getblocks is answered with an inv");
        assert_eq!(
            inv,
            vec![
                InventoryHash::Block(b1.hash()),
                InventoryHash::Block(b2.hash())
            ]
        );
    }
}
