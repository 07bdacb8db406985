//! Wire (de)serialization for blocks and headers.

use std::convert::TryInto;
use std::io::{self, Read, Write};
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::compactint::CompactInt;
use crate::serialization::sha256d;
use crate::transaction::Transaction;
use crate::work::difficulty::CompactDifficulty;
use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::{merkle, Block, CountedHeader, Hash, Header};

/// The maximum size of a Bitcoin block, in bytes.
pub const MAX_BLOCK_BYTES: u64 = 4_000_000;

/// Deserializes a block header, caching its hash.
///
/// The 80 header bytes are buffered so the hash falls out of
/// deserialization without a later re-serialization.
impl BitcoinDeserialize for Header {
    fn bitcoin_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut raw = [0u8; Header::len()];
        reader.read_exact(&mut raw)?;

        let mut hash_writer = sha256d::Writer::default();
        hash_writer
            .write_all(&raw)
            .expect("writing to a hash writer is infallible");
        let own_hash = Hash::from_bytes_exact(hash_writer.finish());

        let mut src = io::Cursor::new(&raw[..]);
        let header = Header::new(
            u32::bitcoin_deserialize(&mut src)?,
            Hash::bitcoin_deserialize(&mut src)?,
            merkle::Root::bitcoin_deserialize(&mut src)?,
            Utc.timestamp(u32::bitcoin_deserialize(&mut src)? as i64, 0),
            CompactDifficulty::bitcoin_deserialize(&mut src)?,
            u32::bitcoin_deserialize(&mut src)?,
        );
        Ok(header.with_cached_hash(own_hash))
    }
}

impl BitcoinDeserialize for Block {
    fn bitcoin_deserialize<R: Read>(reader: R) -> Result<Self, SerializationError> {
        let mut src = reader.take(MAX_BLOCK_BYTES);

        let header = Header::bitcoin_deserialize(&mut src)?;
        let tx_count = CompactInt::bitcoin_deserialize(&mut src)?.value();

        // Sanity check the count before allocating: every transaction needs
        // at least one 36-byte outpoint plus overhead.
        if tx_count > MAX_BLOCK_BYTES / (36 * 4) {
            return Err(SerializationError::Parse(
                "Block contained too many transactions for each to have at least one input",
            ));
        }
        let mut transactions = Vec::with_capacity(
            tx_count
                .try_into()
                .expect("tx count below MAX_BLOCK_BYTES / (36 * 4) fits in usize"),
        );
        for _ in 0..tx_count {
            transactions.push(<Arc<Transaction>>::bitcoin_deserialize(&mut src)?);
        }

        Ok(Block {
            header,
            transactions,
        })
    }
}

impl BitcoinSerialize for CountedHeader {
    fn bitcoin_serialize<W: Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.header.bitcoin_serialize(&mut target)?;
        CompactInt::from(self.transaction_count).bitcoin_serialize(&mut target)?;
        Ok(())
    }
}

impl BitcoinDeserialize for CountedHeader {
    fn bitcoin_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(CountedHeader {
            header: Header::bitcoin_deserialize(&mut reader)?,
            transaction_count: CompactInt::bitcoin_deserialize(&mut reader)?.value() as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::BitcoinDeserializeInto;

    #[test]
    fn genesis_block_roundtrip() {
        sable_test::init();

        let bytes = &sable_test::vectors::GENESIS_BLOCK_MAINNET[..];
        let block: Block = bytes
            .bitcoin_deserialize_into()
            .expect("the genesis block deserializes");

        assert_eq!(
            block.hash(),
            crate::parameters::genesis_hash(crate::parameters::Network::Mainnet),
        );
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.header.merkle_root, block.merkle_root());

        let reserialized = block
            .bitcoin_serialize_to_vec()
            .expect("serializing into a vec never fails");
        assert_eq!(&reserialized[..], bytes);
    }

    #[test]
    fn header_deserialize_caches_hash() {
        sable_test::init();

        let bytes = &sable_test::vectors::GENESIS_BLOCK_MAINNET[..Header::len()];
        let header: Header = bytes
            .bitcoin_deserialize_into()
            .expect("an 80-byte header deserializes");
        assert_eq!(header.cached_hash(), Some(header.hash()));
    }
}
