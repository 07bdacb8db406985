//! The BIP 37 bloom filter peers load to subscribe to a subset of
//! transactions.

use std::io::Cursor;

use murmur3::murmur3_32;

use sable_chain::transaction::Transaction;
use sable_chain::transparent::Input;

use crate::constants::{MAX_FILTER_HASH_FUNCS, MAX_FILTER_SIZE};

/// The seed multiplier fixed by BIP 37.
const SEED_MULTIPLIER: u64 = 0xFBA4_C795;

/// A bloom filter over arbitrary data elements, keyed by a per-peer tweak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// The filter bit field.
    content: Vec<u8>,
    /// How many hash functions to apply.
    hashes: u32,
    /// Nonce seed.
    tweak: u32,
    /// Bloom update flag; carried but not interpreted, since this node
    /// does not track outpoint updates for remote wallets.
    flags: u8,
}

impl BloomFilter {
    /// Build a filter from the fields of a `filterload` message.
    pub fn from_parts(content: Vec<u8>, hashes: u32, tweak: u32, flags: u8) -> BloomFilter {
        BloomFilter {
            content,
            hashes,
            tweak,
            flags,
        }
    }

    /// The `filterload` bounds: at most 36,000 bytes and 50 hash functions.
    pub fn is_within_size_constraints(&self) -> bool {
        !self.content.is_empty()
            && self.content.len() <= MAX_FILTER_SIZE
            && self.hashes >= 1
            && self.hashes <= MAX_FILTER_HASH_FUNCS
    }

    fn bit_index(&self, hash_index: u32, data: &[u8]) -> usize {
        let seed = (hash_index as u64 * SEED_MULTIPLIER + self.tweak as u64) as u32;
        let hash = murmur3_32(&mut Cursor::new(data), seed)
            .expect("reading from an in-memory cursor is infallible");
        (hash as usize) % (self.content.len() * 8)
    }

    /// Add a data element to the filter.
    pub fn insert(&mut self, data: &[u8]) {
        if self.content.is_empty() {
            return;
        }
        for hash_index in 0..self.hashes {
            let index = self.bit_index(hash_index, data);
            self.content[index >> 3] |= 1 << (7 & index);
        }
    }

    /// Check whether the filter contains a data element. False positives
    /// are expected; false negatives never happen.
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.content.is_empty() || self.hashes == 0 {
            return false;
        }
        for hash_index in 0..self.hashes {
            let index = self.bit_index(hash_index, data);
            if self.content[index >> 3] & (1 << (7 & index)) == 0 {
                return false;
            }
        }
        true
    }

    /// The BIP 37 transaction match: the txid, any data element pushed by
    /// an output script, or any spent outpoint.
    pub fn matches_transaction(&self, transaction: &Transaction) -> bool {
        if self.contains(&transaction.hash().0) {
            return true;
        }
        for output in &transaction.outputs {
            for element in script_push_data(output.lock_script.as_bytes()) {
                if self.contains(element) {
                    return true;
                }
            }
        }
        for input in &transaction.inputs {
            if let Input::PrevOut { outpoint, .. } = input {
                let mut serialized = Vec::with_capacity(36);
                serialized.extend_from_slice(&outpoint.hash.0);
                serialized.extend_from_slice(&outpoint.index.to_le_bytes());
                if self.contains(&serialized) {
                    return true;
                }
            }
        }
        false
    }
}

/// Iterate the data elements pushed by a script, ignoring non-push opcodes.
fn script_push_data(script: &[u8]) -> impl Iterator<Item = &[u8]> {
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    let mut pc = 0usize;
    std::iter::from_fn(move || {
        while pc < script.len() {
            let opcode = script[pc];
            pc += 1;
            if opcode == 0 || opcode > OP_PUSHDATA4 {
                continue;
            }
            let len = match opcode {
                OP_PUSHDATA1 => {
                    let len = *script.get(pc)? as usize;
                    pc += 1;
                    len
                }
                OP_PUSHDATA2 => {
                    let bytes = script.get(pc..pc + 2)?;
                    pc += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                OP_PUSHDATA4 => {
                    let bytes = script.get(pc..pc + 4)?;
                    pc += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                direct => direct as usize,
            };
            let data = script.get(pc..pc + len)?;
            pc += len;
            return Some(data);
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut filter = BloomFilter::from_parts(vec![0u8; 200], 10, 0x0012_3123, 0);
        assert!(filter.is_within_size_constraints());

        let element = hex::decode("84487d5b5448dcb272921965eebb266728b25853").unwrap();
        assert!(!filter.contains(&element));
        filter.insert(&element);
        assert!(filter.contains(&element));
        assert!(!filter.contains(&hex::decode("deadbeef").unwrap()));
    }

    #[test]
    fn size_constraints() {
        assert!(!BloomFilter::from_parts(vec![], 1, 0, 0).is_within_size_constraints());
        assert!(
            !BloomFilter::from_parts(vec![0; MAX_FILTER_SIZE + 1], 1, 0, 0)
                .is_within_size_constraints()
        );
        assert!(
            !BloomFilter::from_parts(vec![0; 100], MAX_FILTER_HASH_FUNCS + 1, 0, 0)
                .is_within_size_constraints()
        );
        assert!(BloomFilter::from_parts(vec![0; MAX_FILTER_SIZE], 50, 0, 0)
            .is_within_size_constraints());
    }

    #[test]
    fn matches_by_txid_and_script_element() {
        use sable_chain::serialization::BitcoinDeserializeInto;

        let tx: Transaction = (&sable_test::vectors::DUMMY_TX1[..])
            .bitcoin_deserialize_into()
            .unwrap();

        let mut filter = BloomFilter::from_parts(vec![0u8; 512], 6, 7, 0);
        assert!(!filter.matches_transaction(&tx));
        filter.insert(&tx.hash().0);
        assert!(filter.matches_transaction(&tx));
    }
}
