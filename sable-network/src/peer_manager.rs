//! The peer manager: the set of live sessions, the fetch queue, and the
//! rolling estimate of the network's best height.
//!
//! All state here is touched only from the node's event loop; there are no
//! locks in this module.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::constants::{FETCH_RETRY_DELAY, PEER_HEIGHT_WINDOW};
use crate::peer::{PeerId, PeerState};
use crate::protocol::external::InventoryHash;

/// Owns the active peer sessions and the priority queue of outstanding
/// fetches.
pub struct PeerManager {
    peers: HashMap<PeerId, PeerState>,

    /// Maps each queued inventory item to the earliest time it may next be
    /// requested. An item present here is never duplicated across peers'
    /// outstanding `getdata` windows.
    priorities: HashMap<InventoryHash, Instant>,

    /// A rolling window of peers' advertised start heights, used to
    /// estimate the network's best height.
    block_counts: VecDeque<u32>,

    retry_delay: Duration,
}

impl PeerManager {
    pub fn new(total_blocks_estimate: usize) -> PeerManager {
        let mut block_counts = VecDeque::with_capacity(PEER_HEIGHT_WINDOW);
        block_counts.push_back(total_blocks_estimate as u32);
        PeerManager {
            peers: HashMap::new(),
            priorities: HashMap::new(),
            block_counts,
            retry_delay: FETCH_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> PeerManager {
        self.retry_delay = retry_delay;
        self
    }

    // ---- session set ----

    /// Add a session to the manager.
    pub fn start(&mut self, peer: PeerState) {
        debug!(addr = %peer.addr, link = ?peer.link, "peer session started");
        self.peers.insert(peer.addr, peer);
        metrics::gauge!("peers.connected", self.peers.len() as f64);
    }

    /// Remove a session. Dropping the returned state closes the
    /// connection task's outbox, which makes it exit.
    pub fn stop(&mut self, id: &PeerId) -> Option<PeerState> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            debug!(addr = %id, "peer session stopped");
            metrics::gauge!("peers.connected", self.peers.len() as f64);
        }
        removed
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.values_mut()
    }

    /// Sessions that have completed their handshake.
    pub fn ready_peers_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.values_mut().filter(|peer| peer.is_ready())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn num_outbound(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.link.is_outbound())
            .count()
    }

    pub fn num_inbound(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| !peer.link.is_outbound())
            .count()
    }

    /// The IP addresses of all connected peers.
    pub fn peer_ip_list(&self) -> Vec<IpAddr> {
        self.peers.keys().map(|addr| addr.ip()).collect()
    }

    // ---- fetch queue ----

    /// Schedule a fetch for `inv`, returning its effective request time.
    ///
    /// A new item is scheduled immediately; re-prioritizing a queued item
    /// pushes it back by the retry delay, so repeated `inv` advertisements
    /// cannot re-trigger a request inside the retry window.
    pub fn prioritize(&mut self, inv: InventoryHash) -> Instant {
        let now = Instant::now();
        let at = match self.priorities.get(&inv) {
            Some(at) => *at + self.retry_delay,
            None => now,
        };
        self.priorities.insert(inv, at);
        trace!(?inv, delay = ?at.saturating_duration_since(now), "prioritized fetch");
        metrics::gauge!("fetch.queued", self.priorities.len() as f64);
        at
    }

    /// Note that `inv` was just requested, pushing its next retry out.
    pub fn mark_requested(&mut self, inv: InventoryHash) {
        self.priorities
            .insert(inv, Instant::now() + self.retry_delay);
    }

    /// Remove a satisfied fetch.
    pub fn dequeue(&mut self, inv: &InventoryHash) {
        if self.priorities.remove(inv).is_some() {
            trace!(?inv, "dequeued fetch");
            metrics::gauge!("fetch.queued", self.priorities.len() as f64);
        }
    }

    pub fn queued(&self, inv: &InventoryHash) -> bool {
        self.priorities.contains_key(inv)
    }

    /// Queued items whose request time has come, oldest first.
    pub fn due_fetches(&self, now: Instant) -> Vec<InventoryHash> {
        let mut due: Vec<(InventoryHash, Instant)> = self
            .priorities
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(inv, at)| (*inv, *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.into_iter().map(|(inv, _)| inv).collect()
    }

    // ---- best height ----

    /// Feed a peer's advertised start height into the rolling window.
    pub fn record_peer_height(&mut self, height: u32) {
        if self.block_counts.len() == PEER_HEIGHT_WINDOW {
            self.block_counts.pop_front();
        }
        self.block_counts.push_back(height);
    }

    /// The median of recently advertised peer heights.
    pub fn best_height_estimate(&self) -> u32 {
        let mut heights: Vec<u32> = self.block_counts.iter().copied().collect();
        heights.sort_unstable();
        heights[heights.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_chain::transaction;

    fn inv(tag: u8) -> InventoryHash {
        InventoryHash::Tx(transaction::Hash([tag; 32]))
    }

    #[test]
    fn prioritize_backs_off_within_the_retry_window() {
        let mut manager = PeerManager::new(0);

        let first = manager.prioritize(inv(1));
        assert!(first <= Instant::now());

        let second = manager.prioritize(inv(1));
        assert!(second >= first + FETCH_RETRY_DELAY);

        let third = manager.prioritize(inv(1));
        assert!(third >= first + 2 * FETCH_RETRY_DELAY);
    }

    #[test]
    fn dequeue_clears_the_schedule() {
        let mut manager = PeerManager::new(0);
        manager.prioritize(inv(2));
        assert!(manager.queued(&inv(2)));

        manager.dequeue(&inv(2));
        assert!(!manager.queued(&inv(2)));

        // Re-prioritizing after a dequeue schedules immediately again.
        let at = manager.prioritize(inv(2));
        assert!(at <= Instant::now());
    }

    #[test]
    fn due_fetches_are_oldest_first() {
        let mut manager = PeerManager::new(0).with_retry_delay(Duration::from_secs(0));
        manager.prioritize(inv(3));
        manager.prioritize(inv(4));

        let due = manager.due_fetches(Instant::now() + Duration::from_millis(10));
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn best_height_is_the_window_median() {
        let mut manager = PeerManager::new(100);
        assert_eq!(manager.best_height_estimate(), 100);

        for height in [350_000u32, 350_002, 349_998, 350_001, 350_000].iter() {
            manager.record_peer_height(*height);
        }
        // The build-time estimate has rolled out of the window.
        assert_eq!(manager.best_height_estimate(), 350_000);
    }
}
