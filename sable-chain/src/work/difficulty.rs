//! Block difficulty data structures and calculations.
//!
//! The block difficulty "target threshold" is stored in the block header as
//! a 32-bit `CompactDifficulty` (the `nBits` format). The `block::Hash` must
//! be less than or equal to the `ExpandedDifficulty` threshold, when both
//! are interpreted as 256-bit integers in little-endian byte order.

use primitive_types::U256;

use crate::{block, parameters::Network, BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A 32-bit "compact bits" value, the `nBits` field of a block header.
///
/// Encoding: the high byte is a base-256 exponent, the low 23 bits are the
/// mantissa, and bit 24 is a (consensus-invalid) sign bit.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CompactDifficulty(pub u32);

/// The mantissa mask in a compact difficulty value.
const PRECISION: u32 = 24;
const SIGN_BIT: u32 = 1 << (PRECISION - 1);
const UNSIGNED_MANTISSA_MASK: u32 = SIGN_BIT - 1;

impl CompactDifficulty {
    /// Calculate the expanded threshold for this compact difficulty.
    ///
    /// Returns `None` for negative, zero, or overflowing representations,
    /// which are all invalid in block headers.
    pub fn to_expanded(self) -> Option<ExpandedDifficulty> {
        let exponent = self.0 >> PRECISION;
        let mantissa = self.0 & UNSIGNED_MANTISSA_MASK;

        if self.0 & SIGN_BIT != 0 || mantissa == 0 {
            return None;
        }

        // `mantissa * 256^(exponent - 3)`, as u256 arithmetic.
        let result = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            let shift = 8 * (exponent - 3) as usize;
            // 256-bit overflow makes the header invalid.
            if shift > 255 {
                return None;
            }
            let (result, overflow) = U256::from(mantissa).overflowing_mul(U256::one() << shift);
            if overflow {
                return None;
            }
            result
        };

        if result.is_zero() {
            None
        } else {
            Some(ExpandedDifficulty(result))
        }
    }
}

impl std::fmt::Debug for CompactDifficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CompactDifficulty")
            .field(&format_args!("{:#010x}", self.0))
            .finish()
    }
}

impl BitcoinSerialize for CompactDifficulty {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for CompactDifficulty {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(CompactDifficulty(u32::bitcoin_deserialize(reader)?))
    }
}

/// A 256-bit target threshold.
///
/// Note: the comparisons on this type are u256 integer comparisons, like
/// bitcoind. Greater values represent *less* work.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct ExpandedDifficulty(U256);

impl ExpandedDifficulty {
    /// The easiest valid target threshold for `network` (the "PoW limit").
    pub fn target_difficulty_limit(network: Network) -> ExpandedDifficulty {
        let limit = match network {
            // bitcoind: `~uint256(0) >> 32`
            Network::Mainnet | Network::Testnet => U256::MAX >> 32,
            // regtest relaxes the limit so single-CPU mining succeeds
            Network::Regtest => U256::MAX >> 1,
        };
        ExpandedDifficulty(limit)
    }
}

impl std::fmt::Debug for ExpandedDifficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bytes = [0u8; 32];
        self.0.to_big_endian(&mut bytes);
        f.debug_tuple("ExpandedDifficulty")
            .field(&hex::encode(&bytes))
            .finish()
    }
}

impl From<U256> for ExpandedDifficulty {
    fn from(value: U256) -> Self {
        ExpandedDifficulty(value)
    }
}

impl<'a> From<&'a block::Hash> for U256 {
    fn from(hash: &'a block::Hash) -> Self {
        U256::from_little_endian(&hash.0)
    }
}

impl PartialEq<ExpandedDifficulty> for block::Hash {
    fn eq(&self, other: &ExpandedDifficulty) -> bool {
        U256::from(self) == other.0
    }
}

impl PartialOrd<ExpandedDifficulty> for block::Hash {
    fn partial_cmp(&self, other: &ExpandedDifficulty) -> Option<std::cmp::Ordering> {
        U256::from(self).partial_cmp(&other.0)
    }
}

impl PartialEq<block::Hash> for ExpandedDifficulty {
    fn eq(&self, other: &block::Hash) -> bool {
        other == self
    }
}

impl PartialOrd<block::Hash> for ExpandedDifficulty {
    fn partial_cmp(&self, other: &block::Hash) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering::*;
        other.partial_cmp(self).map(|order| match order {
            Less => Greater,
            Equal => Equal,
            Greater => Less,
        })
    }
}
