//! Chain primitives for the sable node.
//!
//! Blocks, transactions, transparent outputs, the consensus serialization
//! traits, proof-of-work difficulty arithmetic, and the `ChainAdapter`
//! interface through which the networking core reaches whatever block-chain
//! implementation it has been composed with.

#![allow(clippy::try_err)]

#[macro_use]
extern crate serde;

pub mod amount;
pub mod block;
pub mod cached;
pub mod chain;
pub mod compactint;
pub mod fmt;
pub mod parameters;
pub mod serialization;
pub mod transaction;
pub mod transparent;
pub mod work;

pub use cached::Cached;
pub use serialization::{
    BitcoinDeserialize, BitcoinDeserializeInto, BitcoinSerialize, SerializationError,
};
