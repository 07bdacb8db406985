//! The bloom-filter (BIP 37) handler.

use tracing::{debug, trace};

use crate::bloom::BloomFilter;
use crate::constants::MAX_FILTER_ADD_SIZE;
use crate::peer::{DisconnectReason, PeerId};
use crate::protocol::external::types::{Filter, Tweak};
use crate::protocol::external::{Command, Message};

use super::{FilterContext, FilterError, MessageFilter};

/// Applies `filterload`/`filteradd`/`filterclear` to the origin's session.
#[derive(Default)]
pub struct FilterHandler {}

const COMMANDS: [Command; 3] = [
    Command::FilterLoad,
    Command::FilterAdd,
    Command::FilterClear,
];

impl FilterHandler {
    pub fn new() -> FilterHandler {
        FilterHandler {}
    }

    fn handle_filterload(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        filter: &Filter,
        hash_functions_count: u32,
        tweak: Tweak,
        flags: u8,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let bloom = BloomFilter::from_parts(filter.0.clone(), hash_functions_count, tweak.0, flags);
        if !bloom.is_within_size_constraints() {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "filterload outside size constraints",
            )));
        }

        debug!(%origin, bytes = filter.0.len(), hash_functions_count, "loaded bloom filter");
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.filter = Some(bloom);
            peer.relay_txes = true;
        }
        Ok(true)
    }

    fn handle_filteradd(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        data: &[u8],
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        // Nodes must never send a data item larger than the script-element
        // limit, since nothing bigger can ever be matched.
        if data.len() > MAX_FILTER_ADD_SIZE {
            return Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "oversized filteradd data",
            )));
        }
        let peer = match ctx.peers.get_mut(&origin) {
            Some(peer) => peer,
            None => return Ok(false),
        };
        match peer.filter.as_mut() {
            Some(filter) => {
                filter.insert(data);
                trace!(%origin, len = data.len(), "added element to bloom filter");
                Ok(true)
            }
            None => Err(FilterError::Disconnect(DisconnectReason::PeerMisbehaving(
                "filteradd without a loaded filter",
            ))),
        }
    }

    fn handle_filterclear(
        &self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.filter = None;
            peer.relay_txes = true;
            debug!(%origin, "cleared bloom filter, full relay enabled");
        }
        Ok(true)
    }
}

impl MessageFilter for FilterHandler {
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
            Message::FilterLoad {
                filter,
                hash_functions_count,
                tweak,
                flags,
            } => self.handle_filterload(ctx, origin, filter, *hash_functions_count, *tweak, *flags),
            Message::FilterAdd { data } => self.handle_filteradd(ctx, origin, data),
            Message::FilterClear => self.handle_filterclear(ctx, origin),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::TestNet;

    fn filterload(bytes: usize, hash_functions_count: u32) -> Message {
        Message::FilterLoad {
            filter: Filter(vec![0u8; bytes]),
            hash_functions_count,
            tweak: Tweak(99),
            flags: 0,
        }
    }

    #[test]
    fn filterload_then_adds_update_the_session_filter() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        net.dispatch(origin, &filterload(200, 10)).unwrap();
        assert!(net.peers.get(&origin).unwrap().filter.is_some());

        net.dispatch(
            origin,
            &Message::FilterAdd {
                data: vec![0xab; MAX_FILTER_ADD_SIZE],
            },
        )
        .unwrap();
        let peer = net.peers.get(&origin).unwrap();
        assert!(peer
            .filter
            .as_ref()
            .unwrap()
            .contains(&vec![0xab; MAX_FILTER_ADD_SIZE]));

        // An oversized element is a protocol violation.
        let result = net.dispatch(
            origin,
            &Message::FilterAdd {
                data: vec![0xab; MAX_FILTER_ADD_SIZE + 1],
            },
        );
        assert!(matches!(result, Err(DisconnectReason::PeerMisbehaving(_))));
        assert!(!net.peers.contains(&origin));
    }

    #[test]
    fn oversized_filterload_disconnects() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let result = net.dispatch(origin, &filterload(36_001, 10));
        assert!(matches!(result, Err(DisconnectReason::PeerMisbehaving(_))));
    }

    #[test]
    fn filterclear_restores_full_relay() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        net.dispatch(origin, &filterload(100, 5)).unwrap();
        net.dispatch(origin, &Message::FilterClear).unwrap();
        let peer = net.peers.get(&origin).unwrap();
        assert!(peer.filter.is_none());
        assert!(peer.relay_txes);
    }
}
