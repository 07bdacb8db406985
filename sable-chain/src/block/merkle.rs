//! The Bitcoin transaction Merkle tree.

use std::{fmt, io};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};
use crate::transaction;

/// The root of the transaction Merkle tree, binding a block header to the
/// transactions in the block.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Root(pub [u8; 32]);

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("merkle::Root")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    use io::Write;
    let mut writer = sha256d::Writer::default();
    writer
        .write_all(left)
        .and_then(|_| writer.write_all(right))
        .expect("writing to a hash writer is infallible");
    writer.finish()
}

impl std::iter::FromIterator<transaction::Hash> for Root {
    /// Compute the Merkle root of an ordered list of transaction hashes.
    ///
    /// When a level has an odd number of nodes, the last node is paired with
    /// itself (the Bitcoin rule that makes the tree malleable, see
    /// CVE-2012-2459).
    fn from_iter<I>(hashes: I) -> Self
    where
        I: IntoIterator<Item = transaction::Hash>,
    {
        let mut level: Vec<[u8; 32]> = hashes.into_iter().map(|hash| hash.0).collect();
        if level.is_empty() {
            return Root([0u8; 32]);
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [odd] => hash_pair(odd, odd),
                    _ => unreachable!("chunks(2) yields only pairs and singletons"),
                })
                .collect();
        }
        Root(level[0])
    }
}

impl BitcoinSerialize for Root {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Root {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Root(<[u8; 32]>::bitcoin_deserialize(reader)?))
    }
}
