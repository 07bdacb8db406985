//! The ordered filter chain that processes every decoded message.
//!
//! Each filter declares the commands it consumes; dispatch hands a message
//! to every filter whose set matches, in registration order, and
//! OR-combines their results. Filters run to completion on the event loop
//! and must not block.

mod alert;
mod block;
mod bloom;
mod endpoint;
mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub use alert::AlertFilter;
pub use block::BlockFilter;
pub use bloom::FilterHandler;
pub use endpoint::EndpointFilter;
pub use version::VersionFilter;

use tracing::{trace, warn};

use sable_chain::chain::ChainAdapter;

use crate::address_book::AddressBook;
use crate::peer::{DisconnectReason, PeerId};
use crate::peer_manager::PeerManager;
use crate::protocol::external::{Command, Message};

/// Everything a filter may read and update: the session set with its fetch
/// queue, the block-chain collaborator, and the endpoint pool.
///
/// All of it is exclusively owned by the event loop, so filters get plain
/// mutable borrows and no locks exist anywhere in the chain.
pub struct FilterContext<'a> {
    pub peers: &'a mut PeerManager,
    pub chain: &'a mut (dyn ChainAdapter + Send),
    pub address_book: &'a mut AddressBook,
}

impl<'a> FilterContext<'a> {
    /// Guard for filters that require a completed `version` exchange from
    /// the origin.
    pub fn require_version(&self, origin: &PeerId) -> Result<(), FilterError> {
        match self.peers.get(origin) {
            Some(peer) if peer.version_received => Ok(()),
            _ => Err(FilterError::OriginNotReady),
        }
    }
}

/// How a filter failed to process a message.
#[derive(Debug)]
pub enum FilterError {
    /// A non-handshake message arrived before the origin's `version`; the
    /// message is silently dropped.
    OriginNotReady,
    /// The message body didn't hold up under its own semantics; logged and
    /// dropped without disconnecting the peer.
    Malformed(String),
    /// The peer must be dropped.
    Disconnect(DisconnectReason),
}

/// A handler for a subset of the protocol's commands.
pub trait MessageFilter {
    /// The commands this filter consumes.
    fn commands(&self) -> &'static [Command];

    /// Process one message from `origin`. Returns whether the message was
    /// meaningfully handled.
    fn apply(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        message: &Message,
    ) -> Result<bool, FilterError>;
}

/// The ordered list of installed filters.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn MessageFilter + Send>>,
}

impl FilterChain {
    pub fn new() -> FilterChain {
        FilterChain::default()
    }

    /// Register a filter. Dispatch order is installation order.
    pub fn install(&mut self, filter: Box<dyn MessageFilter + Send>) {
        self.filters.push(filter);
    }

    /// Dispatch `message` to every filter whose command set matches.
    ///
    /// `OriginNotReady` and `Malformed` are session-preserving: the message
    /// is dropped (the latter with a log line) and later filters still
    /// run. A `Disconnect` stops dispatch and surfaces to the caller,
    /// which drops the peer.
    pub fn handle_message(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        message: &Message,
    ) -> Result<bool, DisconnectReason> {
        let command = message.command();
        trace!(%origin, %command, "dispatching message");

        let mut handled = false;
        for filter in self.filters.iter_mut() {
            if !filter.commands().contains(&command) {
                continue;
            }
            match filter.apply(ctx, origin, message) {
                Ok(result) => handled |= result,
                Err(FilterError::OriginNotReady) => {
                    trace!(%origin, %command, "dropping message from peer with no version");
                }
                Err(FilterError::Malformed(error)) => {
                    warn!(%origin, %command, %error, "dropping malformed message");
                }
                Err(FilterError::Disconnect(reason)) => return Err(reason),
            }
        }
        trace!(%origin, %command, handled, "dispatch complete");
        Ok(handled)
    }
}
