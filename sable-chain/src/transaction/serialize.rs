//! Contains impls of `BitcoinSerialize`, `BitcoinDeserialize` for the
//! transaction types, so that all of the serialization logic is in one place.

use std::{io, sync::Arc};

use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::*;
use crate::transparent;

/// The maximum size of a transaction (excluding the witness) in bytes.
pub const MAX_TX_SIZE: u64 = 1_000_000;

/// Deserializes a transaction, calculating and caching its TxID.
impl BitcoinDeserialize for Transaction {
    fn bitcoin_deserialize<R: std::io::Read>(src: R) -> Result<Self, SerializationError> {
        // Put a sanity limit of 1 MB on the size of a transaction to protect
        // against DOS attacks.
        let mut src = src.take(MAX_TX_SIZE);
        let version = i32::bitcoin_deserialize(&mut src)?;
        let inputs = <Vec<transparent::Input>>::bitcoin_deserialize(&mut src)?;
        let outputs = <Vec<transparent::Output>>::bitcoin_deserialize(&mut src)?;
        let locktime = LockTime::bitcoin_deserialize(&mut src)?;
        let mut tx = Transaction {
            version,
            inputs,
            outputs,
            locktime,
            hash: Cached::new(),
        };
        // Calculate and cache the TxID.
        let own_hash = tx.hash();
        tx.hash = Cached::from(own_hash);
        Ok(tx)
    }
}

impl<T> BitcoinDeserialize for Arc<T>
where
    T: BitcoinDeserialize,
{
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Arc::new(T::bitcoin_deserialize(reader)?))
    }
}

impl<T> BitcoinSerialize for Arc<T>
where
    T: BitcoinSerialize,
{
    fn bitcoin_serialize<W: io::Write>(&self, writer: W) -> Result<(), io::Error> {
        T::bitcoin_serialize(self, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::BitcoinDeserializeInto;

    #[test]
    fn dummy_tx_roundtrip() {
        sable_test::init();

        let bytes = &sable_test::vectors::DUMMY_TX1[..];
        let tx: Transaction = bytes
            .bitcoin_deserialize_into()
            .expect("the test vector deserializes");

        assert_eq!(tx.len(), bytes.len());
        assert!(tx.is_coinbase());

        let reserialized = tx
            .bitcoin_serialize_to_vec()
            .expect("serializing into a vec never fails");
        assert_eq!(&reserialized[..], bytes);
    }

    #[test]
    fn deserialize_caches_txid() {
        sable_test::init();

        let tx: Transaction = (&sable_test::vectors::DUMMY_TX1[..])
            .bitcoin_deserialize_into()
            .expect("the test vector deserializes");
        assert_eq!(tx.hash.value(), Some(Hash::from(&tx)));
    }
}
