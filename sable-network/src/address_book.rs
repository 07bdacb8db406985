//! The endpoint pool: candidate peer addresses learned from gossip.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::trace;

use crate::meta_addr::MetaAddr;
use crate::protocol::external::types::PeerServices;

/// A set of candidate peer endpoints with last-seen metadata.
///
/// Only ever touched from the node's event loop.
#[derive(Debug, Default)]
pub struct AddressBook {
    by_addr: HashMap<SocketAddr, MetaAddr>,
}

impl AddressBook {
    pub fn new() -> AddressBook {
        AddressBook::default()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Record a gossiped endpoint. Last-seen times from the future are
    /// clamped to the local clock; an existing entry only moves forward.
    pub fn update(&mut self, mut meta: MetaAddr) {
        let now = Utc::now();
        if meta.last_seen > now {
            meta.last_seen = now;
        }
        let entry = self.by_addr.entry(meta.addr).or_insert(meta);
        if meta.last_seen >= entry.last_seen {
            *entry = meta;
        }
        trace!(addr = %meta.addr, total = self.by_addr.len(), "updated address book");
        metrics::gauge!("address_book.size", self.by_addr.len() as f64);
    }

    /// Refresh the last-seen time of `addr`, if it is known.
    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.by_addr.get_mut(&addr) {
            entry.last_seen = Utc::now();
        }
    }

    /// Record a live connection to `addr`, inserting it if unknown.
    pub fn record_connected(&mut self, addr: SocketAddr, services: PeerServices) {
        self.update(MetaAddr::new(addr, services, Utc::now()));
    }

    /// Up to `count` entries, most recently seen first.
    pub fn sample(&self, count: usize) -> Vec<MetaAddr> {
        let mut entries: Vec<MetaAddr> = self.by_addr.values().copied().collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries.truncate(count);
        entries
    }

    /// A random dial candidate, excluding addresses the caller is already
    /// connected (or connecting) to.
    pub fn dial_candidate(
        &self,
        exclude: impl Fn(&SocketAddr) -> bool,
    ) -> Option<SocketAddr> {
        let candidates: Vec<SocketAddr> = self
            .by_addr
            .keys()
            .filter(|addr| !exclude(addr))
            .copied()
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Whether `addr` was seen after `cutoff`.
    pub fn seen_since(&self, addr: &SocketAddr, cutoff: DateTime<Utc>) -> bool {
        self.by_addr
            .get(addr)
            .map(|entry| entry.last_seen >= cutoff)
            .unwrap_or(false)
    }
}
