//! Inventory items for the protocol.

use std::cmp::Ordering;
use std::io::{Read, Write};

use sable_chain::{
    block,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
    transaction,
};

/// An inventory hash which refers to some advertised or requested data.
///
/// Bitcoin calls this an "inventory vector" but it is just a typed hash, not
/// a container, so we do not use that term to avoid confusion with `Vec<T>`.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#Inventory_Vectors)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InventoryHash {
    /// An error.
    ///
    /// The Bitcoin wiki just says "Any data of with this number may be
    /// ignored", so we don't include a typed hash.
    Error,
    /// A hash of a transaction.
    Tx(transaction::Hash),
    /// A hash of a block.
    Block(block::Hash),
    /// A hash of a filtered block.
    ///
    /// Only sensible in `getdata`: the reply is a `merkleblock` message
    /// rather than a `block` message, and only works once a bloom filter
    /// has been set.
    FilteredBlock(block::Hash),
}

impl InventoryHash {
    /// The wire code for this inventory kind.
    fn code(&self) -> u32 {
        match self {
            InventoryHash::Error => 0,
            InventoryHash::Tx(_) => 1,
            InventoryHash::Block(_) => 2,
            InventoryHash::FilteredBlock(_) => 3,
        }
    }

    fn hash_bytes(&self) -> [u8; 32] {
        match *self {
            InventoryHash::Error => [0; 32],
            InventoryHash::Tx(hash) => hash.0,
            InventoryHash::Block(hash) => hash.0,
            InventoryHash::FilteredBlock(hash) => hash.0,
        }
    }

    /// Whether the kind is one of the enumerated, requestable kinds.
    pub fn is_known_type(&self) -> bool {
        !matches!(self, InventoryHash::Error)
    }

    /// The display name of the message this inventory kind is served by.
    pub fn command(&self) -> &'static str {
        match self {
            InventoryHash::Error => "error",
            InventoryHash::Tx(_) => "tx",
            InventoryHash::Block(_) => "block",
            InventoryHash::FilteredBlock(_) => "merkleblock",
        }
    }
}

/// Inventory items are totally ordered by `(kind, hash)`.
impl Ord for InventoryHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.code()
            .cmp(&other.code())
            .then_with(|| self.hash_bytes().cmp(&other.hash_bytes()))
    }
}

impl PartialOrd for InventoryHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<transaction::Hash> for InventoryHash {
    fn from(tx: transaction::Hash) -> InventoryHash {
        InventoryHash::Tx(tx)
    }
}

impl From<block::Hash> for InventoryHash {
    fn from(hash: block::Hash) -> InventoryHash {
        // Auto-convert to Block rather than FilteredBlock, since filtered
        // blocks only make sense inside `getdata` requests.
        InventoryHash::Block(hash)
    }
}

impl BitcoinSerialize for InventoryHash {
    fn bitcoin_serialize<W: Write>(&self, mut writer: W) -> Result<(), std::io::Error> {
        self.code().bitcoin_serialize(&mut writer)?;
        self.hash_bytes().bitcoin_serialize(&mut writer)?;
        Ok(())
    }
}

impl BitcoinDeserialize for InventoryHash {
    fn bitcoin_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        let code = u32::bitcoin_deserialize(&mut reader)?;
        let bytes = <[u8; 32]>::bitcoin_deserialize(&mut reader)?;
        match code {
            0 => Ok(InventoryHash::Error),
            1 => Ok(InventoryHash::Tx(transaction::Hash(bytes))),
            2 => Ok(InventoryHash::Block(block::Hash(bytes))),
            3 => Ok(InventoryHash::FilteredBlock(block::Hash(bytes))),
            _ => Err(SerializationError::Parse("invalid inventory code")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn order_is_kind_first() {
        let tx = InventoryHash::Tx(transaction::Hash([0xff; 32]));
        let block = InventoryHash::Block(block::Hash([0x00; 32]));
        // Kind dominates even when the hashes order the other way.
        assert!(tx < block);
    }

    proptest! {
        #[test]
        fn total_order_is_consistent_with_eq(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
            kind_a in 1u32..=3,
            kind_b in 1u32..=3,
        ) {
            let make = |kind: u32, bytes: [u8; 32]| match kind {
                1 => InventoryHash::Tx(transaction::Hash(bytes)),
                2 => InventoryHash::Block(block::Hash(bytes)),
                _ => InventoryHash::FilteredBlock(block::Hash(bytes)),
            };
            let lhs = make(kind_a, a);
            let rhs = make(kind_b, b);

            prop_assert_eq!(lhs == rhs, lhs.cmp(&rhs) == Ordering::Equal);
            prop_assert_eq!(lhs.cmp(&rhs), rhs.cmp(&lhs).reverse());
        }

        #[test]
        fn wire_roundtrip(bytes in any::<[u8; 32]>(), kind in 1u32..=3) {
            let inv = match kind {
                1 => InventoryHash::Tx(transaction::Hash(bytes)),
                2 => InventoryHash::Block(block::Hash(bytes)),
                _ => InventoryHash::FilteredBlock(block::Hash(bytes)),
            };
            let encoded = inv.bitcoin_serialize_to_vec()?;
            prop_assert_eq!(encoded.len(), 36);
            let decoded = InventoryHash::bitcoin_deserialize(&encoded[..])?;
            prop_assert_eq!(inv, decoded);
        }
    }
}
