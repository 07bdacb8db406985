//! Definitions of constants.

use std::time::Duration;

use crate::protocol::external::types::ProtocolVersion;

/// The network protocol version used on handshake.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion(70_001);

/// The oldest protocol version we are willing to talk to.
pub const MIN_VERSION: ProtocolVersion = ProtocolVersion(209);

/// Peers at or above this version expect a `pong` for every nonce-carrying
/// `ping` (BIP 31).
pub const BIP31_VERSION: ProtocolVersion = ProtocolVersion(60_000);

/// The user agent advertised in `version` messages.
pub const USER_AGENT: &str = "/sable:1.0.0-alpha/";

/// Maximum accepted protocol message body length.
pub const MAX_PROTOCOL_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Maximum entries in an `addr` message.
pub const MAX_ADDRS_IN_MESSAGE: usize = 1000;

/// Maximum entries in an `inv` or `getdata` message.
pub const MAX_INV_IN_MESSAGE: usize = 50_000;

/// Maximum `inv` entries sent in reply to a `getblocks` message.
pub const MAX_GETBLOCKS_RESULTS: usize = 500;

/// Maximum headers sent in reply to a `getheaders` message.
pub const MAX_GETHEADERS_RESULTS: usize = 2000;

/// How long an outstanding `getdata` may go unanswered before the item is
/// eligible for re-request through another peer.
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(2 * 60);

/// Cross-peer rate limit for re-requesting the same inventory item.
pub const ALREADY_ASKED_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// A peer that has not completed its handshake within this window is closed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// A peer with no received traffic for this window is closed.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// How long a dial attempt may take before it is abandoned.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the node sweeps timers: fetch retries, handshake and
/// inactivity timeouts, outbound connection upkeep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on each peer's known-inventory set.
pub const KNOWN_INVENTORY_LIMIT: usize = 1000;

/// Bound on each peer's known-endpoint set.
pub const KNOWN_ADDRESSES_LIMIT: usize = 1000;

/// Bound on the orphan block pool; the oldest entry is evicted beyond it.
pub const ORPHAN_POOL_LIMIT: usize = 100;

/// The number of peer `start_height` advertisements kept in the rolling
/// window used to estimate the network's best height.
pub const PEER_HEIGHT_WINDOW: usize = 5;

/// Endpoints relayed from an `addr` message must be at most this old.
pub const ADDR_RELAY_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Number of peers a fresh endpoint is relayed to.
pub const ADDR_RELAY_FANOUT: usize = 2;

/// Maximum size of a loaded bloom filter, in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions in a loaded bloom filter.
pub const MAX_FILTER_HASH_FUNCS: u32 = 50;

/// Maximum size of a `filteradd` data element (the script-element limit).
pub const MAX_FILTER_ADD_SIZE: usize = 520;
