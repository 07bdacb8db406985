//! The interface between the networking core and the block chain it serves.
//!
//! The networking filters never touch storage directly; they reach whatever
//! block-chain implementation the node was composed with through this trait.
//! The implementation owns its own transaction discipline and is only ever
//! called from the node's event loop.

use std::sync::Arc;

use crate::block::{self, Block, CountedHeader};
use crate::transaction::{self, Transaction};

/// The outcome of offering a block or transaction to the chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AcceptOutcome {
    /// The item was accepted and stored.
    Accepted,
    /// The item was already known; nothing changed.
    AlreadyHave,
    /// The block's parent is unknown; the caller should hold it and fetch
    /// ancestors.
    Orphan,
    /// The item failed validation.
    Invalid(String),
}

impl AcceptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptOutcome::Accepted)
    }
}

/// Read and append access to a block chain.
pub trait ChainAdapter {
    /// The height of the best chain tip.
    fn best_height(&self) -> block::Height;

    /// A build-time estimate of the network's block count, used before any
    /// peers have told us their heights.
    fn total_blocks_estimate(&self) -> usize;

    /// Whether `hash` is a block on a known chain.
    fn contains_block(&self, hash: &block::Hash) -> bool;

    /// Whether `hash` is a known (confirmed or mempool) transaction.
    fn contains_transaction(&self, hash: &transaction::Hash) -> bool;

    fn get_block(&self, hash: &block::Hash) -> Option<Arc<Block>>;

    fn get_header(&self, hash: &block::Hash) -> Option<block::Header>;

    fn get_transaction(&self, hash: &transaction::Hash) -> Option<Arc<Transaction>>;

    /// Validate `block` and append it to the chain.
    fn accept_block(&mut self, block: Arc<Block>) -> AcceptOutcome;

    /// Validate `transaction` and admit it to the mempool.
    fn accept_transaction(&mut self, transaction: Arc<Transaction>) -> AcceptOutcome;

    /// A block locator for the best chain: geometrically-spaced hashes from
    /// the tip backward, always ending at genesis.
    fn locator(&self) -> Vec<block::Hash>;

    /// The hashes of up to `max` best-chain blocks after the highest locator
    /// match, stopping early at `stop`.
    fn blocks_after(
        &self,
        locator: &[block::Hash],
        stop: Option<block::Hash>,
        max: usize,
    ) -> Vec<block::Hash>;

    /// Like [`ChainAdapter::blocks_after`], but returning headers with
    /// transaction counts.
    fn headers_after(
        &self,
        locator: &[block::Hash],
        stop: Option<block::Hash>,
        max: usize,
    ) -> Vec<CountedHeader>;
}
