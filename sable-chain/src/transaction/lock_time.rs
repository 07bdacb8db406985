use std::convert::TryInto;
use std::io;

use chrono::{DateTime, TimeZone, Utc};

use crate::block::Height;
use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A transaction lock time.
///
/// Wire values below `500_000_000` are block heights; values at or above
/// the threshold are Unix timestamps.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LockTime {
    /// Unlocked at the given block height.
    Height(Height),
    /// Unlocked at the given time.
    Time(DateTime<Utc>),
}

impl LockTime {
    /// The smallest wire value interpreted as a timestamp rather than a
    /// height.
    pub const MIN_TIMESTAMP: u32 = 500_000_000;

    /// A lock time that has always already passed.
    pub fn unlocked() -> LockTime {
        LockTime::Height(Height(0))
    }
}

impl BitcoinSerialize for LockTime {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        match self {
            LockTime::Height(height) => height.0.bitcoin_serialize(target),
            LockTime::Time(time) => {
                let stamp: u32 = time
                    .timestamp()
                    .try_into()
                    .expect("lock times are always in the u32 range");
                stamp.bitcoin_serialize(target)
            }
        }
    }
}

impl BitcoinDeserialize for LockTime {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        let raw = u32::bitcoin_deserialize(reader)?;
        if raw < LockTime::MIN_TIMESTAMP {
            Ok(LockTime::Height(Height(raw)))
        } else {
            Ok(LockTime::Time(Utc.timestamp(raw as i64, 0)))
        }
    }
}
