//! An address with metadata on its advertised services and last-seen time.

use std::io;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use sable_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use crate::protocol::external::types::PeerServices;

/// An address with metadata on its advertised services and last-seen time,
/// the entry type of `addr` messages and the address book.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MetaAddr {
    /// The peer's address.
    pub addr: SocketAddr,

    /// The services advertised by the peer.
    pub services: PeerServices,

    /// When the peer was last seen, as reported by the advertising peer.
    ///
    /// This field is untrusted gossip; the address book clamps it to the
    /// local clock.
    pub last_seen: DateTime<Utc>,
}

impl MetaAddr {
    pub fn new(addr: SocketAddr, services: PeerServices, last_seen: DateTime<Utc>) -> MetaAddr {
        MetaAddr {
            addr,
            services,
            last_seen,
        }
    }
}

impl BitcoinSerialize for MetaAddr {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.last_seen.bitcoin_serialize(&mut writer)?;
        self.services.bitcoin_serialize(&mut writer)?;
        self.addr.bitcoin_serialize(&mut writer)?;
        Ok(())
    }
}

impl BitcoinDeserialize for MetaAddr {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(MetaAddr {
            last_seen: <DateTime<Utc>>::bitcoin_deserialize(&mut reader)?,
            services: PeerServices::bitcoin_deserialize(&mut reader)?,
            addr: SocketAddr::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wire_roundtrip() {
        let meta = MetaAddr::new(
            "203.0.113.6:8333".parse().unwrap(),
            PeerServices::NODE_NETWORK,
            Utc.timestamp(1_573_680_222, 0),
        );
        let bytes = meta.bitcoin_serialize_to_vec().unwrap();
        // 4 time + 8 services + 16 address + 2 port
        assert_eq!(bytes.len(), 30);
        assert_eq!(MetaAddr::bitcoin_deserialize(&bytes[..]).unwrap(), meta);
    }
}
