//! Transparent-related (Bitcoin-inherited) functionality.
#![allow(clippy::unit_arg)]

mod script;
mod serialize;

pub use script::Script;

use sable_serde_derive::{BtcDeserialize, BtcSerialize};

use crate::{
    cached::Cached, compactint::CompactInt, BitcoinDeserialize, BitcoinSerialize,
    SerializationError,
};

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;

use crate::{
    amount::{Amount, NonNegative},
    block, transaction,
};

/// Arbitrary data inserted by miners into a coinbase transaction.
///
/// Includes the BIP 34 block height push, which is kept in place so
/// re-serialization is byte-exact; the parsed height is cached separately on
/// the input.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, BtcDeserialize, BtcSerialize)]
pub struct CoinbaseData(
    /// Invariant: this vec must be at most 100 bytes. We enforce this by only
    /// constructing CoinbaseData fields by parsing blocks with 100-byte data
    /// fields.
    pub Vec<u8>,
);

impl AsRef<[u8]> for CoinbaseData {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl CoinbaseData {
    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }
}

impl std::fmt::Debug for CoinbaseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let escaped = String::from_utf8(
            self.0
                .iter()
                .cloned()
                .flat_map(std::ascii::escape_default)
                .collect(),
        )
        .expect("ascii::escape_default produces utf8");
        f.debug_tuple("CoinbaseData").field(&escaped).finish()
    }
}

/// OutPoint
///
/// A particular transaction output reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, BtcSerialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub struct OutPoint {
    /// References the transaction that contains the UTXO being spent.
    pub hash: transaction::Hash,

    /// Identifies which UTXO from that transaction is referenced; the
    /// first output is 0, etc.
    pub index: u32,
}

impl OutPoint {
    #[inline]
    pub const fn len() -> usize {
        36
    }

    /// The all-zero outpoint used by coinbase inputs.
    pub fn null() -> OutPoint {
        OutPoint {
            hash: transaction::Hash([0u8; 32]),
            index: std::u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash.0 == [0u8; 32] && self.index == std::u32::MAX
    }
}

/// A transparent input to a transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Input {
    /// A reference to an output of a previous transaction.
    PrevOut {
        /// The previous output transaction reference.
        outpoint: OutPoint,
        /// The script that authorizes spending `outpoint`.
        unlock_script: Script,
        /// The sequence number for the output.
        sequence: u32,
    },
    /// New coins created by the block reward.
    Coinbase {
        /// The BIP 34 height of this block, parsed from the coinbase data.
        /// Wrapped in an explicit option to make it clear that not all
        /// blocks encode a height.
        height: Option<Cached<block::Height>>,
        /// Free data inserted by miners, including the height push.
        data: CoinbaseData,
        /// The sequence number for the output.
        sequence: u32,
    },
}

impl Input {
    /// Returns the serialized length (in bytes) of this input.
    pub fn len(&self) -> usize {
        match *self {
            Input::PrevOut {
                ref unlock_script, ..
            } => OutPoint::len() + unlock_script.serialized_size() + 4,
            Input::Coinbase { ref data, .. } => OutPoint::len() + data.serialized_size() + 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A transparent output from a transaction.
///
/// The most fundamental building block of a transaction is a transaction
/// output -- the coins you own are in fact a subset of unspent transaction
/// outputs (or "UTXO"s) of the global UTXO set.
///
/// UTXOs are indivisible, discrete units of value which can only be
/// consumed in their entirety.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, BtcDeserialize, BtcSerialize)]
pub struct Output {
    /// Transaction value.
    // At https://en.bitcoin.it/wiki/Protocol_documentation#tx, this is an i64.
    pub value: Amount<NonNegative>,

    /// The lock script defines the conditions under which this output can be
    /// spent.
    pub lock_script: Script,
}

impl Output {
    /// Returns the serialized length (in bytes) of this Output
    pub fn len(&self) -> usize {
        8 + self.lock_script.serialized_size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
