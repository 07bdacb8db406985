//! Wire (de)serialization for transparent inputs.

use std::io;

use crate::block::Height;
use crate::cached::Cached;
use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::{CoinbaseData, Input, OutPoint, Script};

impl BitcoinDeserialize for OutPoint {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(OutPoint {
            hash: crate::transaction::Hash::bitcoin_deserialize(&mut reader)?,
            index: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

/// Opportunistically parse a BIP 34 height push from the front of coinbase
/// data. Pre-BIP-34 blocks reuse the same bytes for arbitrary data, so a
/// parse failure is not an error.
fn parse_coinbase_height(data: &[u8]) -> Option<Height> {
    let push_len = *data.get(0)? as usize;
    if !(1..=5).contains(&push_len) || data.len() < 1 + push_len {
        return None;
    }
    let mut height: u64 = 0;
    for (pos, byte) in data[1..=push_len].iter().enumerate() {
        height |= (*byte as u64) << (8 * pos);
    }
    if height > Height::MAX.0 as u64 {
        None
    } else {
        Some(Height(height as u32))
    }
}

impl BitcoinDeserialize for Input {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let outpoint = OutPoint::bitcoin_deserialize(&mut reader)?;
        if outpoint.is_null() {
            let data = Vec::<u8>::bitcoin_deserialize(&mut reader)?;
            if data.len() > 100 {
                return Err(SerializationError::Parse("coinbase data is too long"));
            }
            let sequence = u32::bitcoin_deserialize(&mut reader)?;
            Ok(Input::Coinbase {
                height: parse_coinbase_height(&data).map(Cached::from),
                data: CoinbaseData(data),
                sequence,
            })
        } else {
            Ok(Input::PrevOut {
                outpoint,
                unlock_script: Script::bitcoin_deserialize(&mut reader)?,
                sequence: u32::bitcoin_deserialize(&mut reader)?,
            })
        }
    }
}

impl BitcoinSerialize for Input {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        match self {
            Input::PrevOut {
                outpoint,
                unlock_script,
                sequence,
            } => {
                outpoint.bitcoin_serialize(&mut target)?;
                unlock_script.bitcoin_serialize(&mut target)?;
                sequence.bitcoin_serialize(&mut target)?;
            }
            Input::Coinbase {
                data, sequence, ..
            } => {
                OutPoint::null().bitcoin_serialize(&mut target)?;
                data.0.bitcoin_serialize(&mut target)?;
                sequence.bitcoin_serialize(&mut target)?;
            }
        }
        Ok(())
    }
}
