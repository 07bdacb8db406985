//! Newtype wrappers for the primitive types that appear on the wire.

use std::fmt;

use sable_chain::parameters::Network;
use sable_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A magic number identifying the network a message belongs to.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Magic(pub [u8; 4]);

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Magic").field(&hex::encode(&self.0)).finish()
    }
}

impl From<Network> for Magic {
    /// Get the magic value associated to this `Network`.
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => Magic([0xf9, 0xbe, 0xb4, 0xd9]),
            Network::Testnet => Magic([0x0b, 0x11, 0x09, 0x07]),
            Network::Regtest => Magic([0xfa, 0xbf, 0xb5, 0xda]),
        }
    }
}

/// A protocol version number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// The sentinel for "no version received yet".
    pub fn unknown() -> ProtocolVersion {
        ProtocolVersion(0)
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl BitcoinSerialize for ProtocolVersion {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for ProtocolVersion {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(ProtocolVersion(u32::bitcoin_deserialize(reader)?))
    }
}

bitflags::bitflags! {
    /// The network services a peer advertises.
    #[derive(Default)]
    pub struct PeerServices: u64 {
        /// The peer serves the full block chain.
        const NODE_NETWORK = 1;
        /// The peer supports BIP 37 bloom-filtered connections.
        const NODE_BLOOM = 1 << 2;
    }
}

impl BitcoinSerialize for PeerServices {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.bits().bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for PeerServices {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        // Unknown service bits are tolerated and preserved.
        Ok(PeerServices::from_bits_truncate(u64::bitcoin_deserialize(
            reader,
        )?))
    }
}

/// A nonce used to associate requests with responses, and to detect
/// connections to self.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Nonce(pub u64);

impl Default for Nonce {
    fn default() -> Self {
        use rand::{thread_rng, Rng};
        Self(thread_rng().gen())
    }
}

impl BitcoinSerialize for Nonce {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Nonce {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Nonce(u64::bitcoin_deserialize(reader)?))
    }
}

/// A random value to add to the seed value in the hash function used by a
/// bloom filter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tweak(pub u32);

/// A bloom filter's raw bit field, as carried by `filterload`.
#[derive(Clone, Eq, PartialEq)]
pub struct Filter(pub Vec<u8>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Filter")
            .field(&format!("{} bytes", self.0.len()))
            .finish()
    }
}
