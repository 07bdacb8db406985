//! Networking code for sable.
//!
//! This crate implements the peer-to-peer engine: the framing codec and
//! typed protocol messages, per-connection peer sessions, the peer manager
//! with its fetch queue, the ordered filter chain that processes every
//! decoded message, and the node that composes them on one event loop.
//!
//! All peer, filter, and manager state lives inside the node's event-loop
//! task; connection tasks only frame bytes and shuttle messages over
//! channels. Parallelism exists only inside the script-verifier pool owned
//! by the block-chain collaborator.

#![allow(clippy::try_err)]

pub mod address_book;
pub mod bloom;
pub mod config;
pub mod constants;
pub mod filters;
pub mod meta_addr;
pub mod node;
pub mod peer;
pub mod peer_manager;
pub mod protocol;

pub use address_book::AddressBook;
pub use config::Config;
pub use meta_addr::MetaAddr;
pub use node::{Node, ShutdownHandle};
pub use peer::{Link, PeerId};
pub use protocol::external::{Codec, InventoryHash, Message};
