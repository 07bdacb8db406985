//! Genesis blocks for each network.
//!
//! Every network shares the same coinbase transaction; only the header
//! fields differ, so the variants are derived from the mainnet
//! serialization rather than stored separately.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;

use sable_chain::block::{Block, Header};
use sable_chain::parameters::{genesis_hash, Network};
use sable_chain::serialization::BitcoinDeserializeInto;
use sable_chain::work::difficulty::CompactDifficulty;

lazy_static! {
    static ref GENESIS_MAINNET_BYTES: Vec<u8> = hex::decode(
        "0100000000000000000000000000000000000000000000000000000000000000\
         000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa\
         4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100000000000000000000\
         00000000000000000000000000000000000000000000ffffffff4d04ffff001d\
         0104455468652054696d65732030332f4a616e2f32303039204368616e63656c\
         6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f75742066\
         6f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe554827\
         1967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4\
         f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000"
    )
    .expect("hard-coded hex decodes");
}

/// Build the genesis block for `network`.
pub fn genesis_block(network: Network) -> Arc<Block> {
    let mainnet: Block = (&GENESIS_MAINNET_BYTES[..])
        .bitcoin_deserialize_into()
        .expect("the hard-coded genesis block deserializes");

    let block = match network {
        Network::Mainnet => mainnet,
        Network::Testnet => Block {
            header: Header::new(
                1,
                mainnet.header.previous_block_hash,
                mainnet.header.merkle_root,
                Utc.timestamp(1_296_688_602, 0),
                CompactDifficulty(0x1d00ffff),
                414_098_458,
            ),
            transactions: mainnet.transactions,
        },
        Network::Regtest => Block {
            header: Header::new(
                1,
                mainnet.header.previous_block_hash,
                mainnet.header.merkle_root,
                Utc.timestamp(1_296_688_602, 0),
                CompactDifficulty(0x207fffff),
                2,
            ),
            transactions: mainnet.transactions,
        },
    };

    assert_eq!(
        block.hash(),
        genesis_hash(network),
        "the constructed genesis block must hash to the network's well-known value",
    );
    Arc::new(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_networks_have_a_genesis_block() {
        sable_test::init();
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest].iter() {
            let block = genesis_block(*network);
            assert_eq!(block.transactions.len(), 1);
        }
    }
}
