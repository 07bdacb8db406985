use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The height of a block is the length of the chain back to the genesis
/// block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Height(pub u32);

impl Height {
    /// The genesis height.
    pub const MIN: Height = Height(0);

    /// The maximum representable height.
    ///
    /// Users should not search for blocks above this height; the BIP34
    /// coinbase encoding also breaks down past `2^31 - 1`.
    pub const MAX: Height = Height(i32::max_value() as u32);
}

impl std::fmt::Display for Height {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl BitcoinSerialize for Height {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Height {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Height(u32::bitcoin_deserialize(reader)?))
    }
}
