use std::collections::HashSet;
use std::io::Write;

use sable_serde_derive::{BtcDeserialize, BtcSerialize};

use sable_chain::{
    block,
    compactint::CompactInt,
    serialization::sha256d,
    transaction, {BitcoinDeserialize, BitcoinSerialize, SerializationError},
};

/// A `merkleblock` message: a block header plus a partial merkle tree
/// proving which transactions a peer's bloom filter matched.
///
/// Matched transactions themselves are sent separately as `tx` messages.
#[derive(BtcDeserialize, BtcSerialize, Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub block_header: block::Header,
    pub transaction_count: u32,
    pub hashes: Vec<transaction::Hash>,
    pub flags: Vec<u8>,
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut writer = sha256d::Writer::default();
    writer
        .write_all(left)
        .and_then(|_| writer.write_all(right))
        .expect("writing to a hash writer is infallible");
    writer.finish()
}

struct TreeBuilder<'a> {
    txids: &'a [transaction::Hash],
    matched: &'a HashSet<transaction::Hash>,
    bits: Vec<bool>,
    hashes: Vec<transaction::Hash>,
}

impl<'a> TreeBuilder<'a> {
    fn width(&self, height: u32) -> usize {
        (self.txids.len() + (1 << height) - 1) >> height
    }

    fn calc_hash(&self, height: u32, pos: usize) -> [u8; 32] {
        if height == 0 {
            return self.txids[pos].0;
        }
        let left = self.calc_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < self.width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        hash_pair(&left, &right)
    }

    fn traverse(&mut self, height: u32, pos: usize) {
        let begin = pos << height;
        let end = ((pos + 1) << height).min(self.txids.len());
        let parent_of_match = self.txids[begin..end]
            .iter()
            .any(|txid| self.matched.contains(txid));
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            let hash = self.calc_hash(height, pos);
            self.hashes.push(transaction::Hash(hash));
        } else {
            self.traverse(height - 1, pos * 2);
            if pos * 2 + 1 < self.width(height - 1) {
                self.traverse(height - 1, pos * 2 + 1);
            }
        }
    }
}

impl MerkleBlock {
    /// Build the partial merkle tree for `block`, revealing the
    /// transactions in `matched`.
    pub fn from_block(block: &block::Block, matched: &HashSet<transaction::Hash>) -> MerkleBlock {
        let txids: Vec<_> = block.transactions.iter().map(|tx| tx.hash()).collect();

        let mut height = 0u32;
        let mut builder = TreeBuilder {
            txids: &txids,
            matched,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        while builder.width(height) > 1 {
            height += 1;
        }
        builder.traverse(height, 0);

        // Flag bits are packed least-significant-bit first.
        let mut flags = vec![0u8; (builder.bits.len() + 7) / 8];
        for (position, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[position / 8] |= 1 << (position % 8);
            }
        }

        MerkleBlock {
            block_header: block.header,
            transaction_count: block.transactions.len() as u32,
            hashes: builder.hashes,
            flags,
        }
    }

    fn serialized_size(&self) -> usize {
        block::Header::len()
            + 4
            + CompactInt::size(self.hashes.len())
            + (self.hashes.len() * 32)
            + CompactInt::size(self.flags.len())
            + self.flags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_chain::serialization::BitcoinDeserializeInto;

    #[test]
    fn genesis_merkleblock_with_match() {
        sable_test::init();

        let block: block::Block = (&sable_test::vectors::GENESIS_BLOCK_MAINNET[..])
            .bitcoin_deserialize_into()
            .expect("the genesis block deserializes");
        let coinbase = block.transactions[0].hash();

        let matched: HashSet<_> = vec![coinbase].into_iter().collect();
        let merkle_block = MerkleBlock::from_block(&block, &matched);

        assert_eq!(merkle_block.transaction_count, 1);
        // A one-transaction tree reveals exactly that transaction, and its
        // hash doubles as the merkle root.
        assert_eq!(merkle_block.hashes, vec![coinbase]);
        assert_eq!(merkle_block.hashes[0].0, block.header.merkle_root.0);
        assert_eq!(merkle_block.flags, vec![0x01]);

        let bytes = merkle_block.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(bytes.len(), merkle_block.serialized_size());
        let parsed = MerkleBlock::bitcoin_deserialize(&bytes[..]).unwrap();
        assert_eq!(parsed, merkle_block);
    }

    #[test]
    fn unmatched_tree_reveals_only_the_root() {
        sable_test::init();

        let block: block::Block = (&sable_test::vectors::GENESIS_BLOCK_MAINNET[..])
            .bitcoin_deserialize_into()
            .expect("the genesis block deserializes");

        let merkle_block = MerkleBlock::from_block(&block, &HashSet::new());
        assert_eq!(merkle_block.hashes.len(), 1);
        assert_eq!(merkle_block.flags, vec![0x00]);
    }
}
