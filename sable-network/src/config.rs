//! Configuration for the networking core.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use sable_chain::parameters::Network;

/// Configuration for the node's networking layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The address to listen on for inbound peers.
    pub listen_addr: SocketAddr,

    /// The network to join.
    pub network: Network,

    /// Peers to dial on startup, before the address book has entries.
    pub initial_peers: Vec<SocketAddr>,

    /// How many outbound connections the dialer maintains.
    pub target_outbound_peers: usize,

    /// The user agent advertised in handshakes.
    pub user_agent: String,

    /// Whether peers should relay transactions to us before we load a
    /// bloom filter.
    pub relay: bool,

    /// The alert-signing public key for this chain, hex-encoded in SEC 1
    /// format. Empty disables alert processing.
    pub alert_key: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "0.0.0.0:8333"
                .parse()
                .expect("hard-coded address is valid"),
            network: Network::Mainnet,
            initial_peers: Vec::new(),
            target_outbound_peers: 8,
            user_agent: crate::constants::USER_AGENT.to_owned(),
            relay: true,
            // The Bitcoin alert key this protocol family shipped with.
            alert_key: "04fc9702847840aaf195de8442ebecedf5b095cdbb9bc716bda9110971b28a49\
                        e0ead8564ff0db22209e0374782c093bb899692d524e9d6a6956e7c5ecbcd68284"
                .to_owned(),
        }
    }
}
