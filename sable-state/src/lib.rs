//! The in-memory block-chain state for sable.
//!
//! Persistent block files and index databases are outside the node core;
//! this crate provides the reference [`ChainAdapter`] implementation the
//! node and the tests are composed with.
//!
//! [`ChainAdapter`]: sable_chain::chain::ChainAdapter

mod genesis;
mod mem_state;

pub use genesis::genesis_block;
pub use mem_state::ChainState;
