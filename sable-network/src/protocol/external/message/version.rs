use std::io;
use std::net;
use std::net::SocketAddr;

use chrono::{DateTime, TimeZone, Utc};

use sable_chain::block;
use sable_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::super::types::*;

/// A `version` message.
///
/// Note that although this is called `version` in Bitcoin, its role is really
/// analogous to a `ClientHello` message in TLS, used to begin a handshake,
/// and is distinct from a simple version number.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#version)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Version {
    /// The network version number supported by the sender.
    pub version: ProtocolVersion,

    /// The network services advertised by the sender.
    pub services: PeerServices,

    /// The time when the version message was sent.
    ///
    /// Unlike the 4-byte timestamps elsewhere in the protocol, this field
    /// is 8 bytes on the wire.
    pub timestamp: DateTime<Utc>,

    /// The network address of the node receiving this message, and its
    /// advertised network services.
    pub address_recv: (PeerServices, net::SocketAddr),

    /// The network address of the node sending this message, and its
    /// advertised network services.
    pub address_from: (PeerServices, net::SocketAddr),

    /// Node random nonce, randomly generated every time a version
    /// packet is sent. This nonce is used to detect connections
    /// to self.
    pub nonce: Nonce,

    /// The user agent advertised by the sender.
    pub user_agent: String,

    /// The last block received by the emitting node.
    pub start_height: block::Height,

    /// Whether the remote peer should announce relayed
    /// transactions or not, see [BIP 0037](https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki)
    pub relay: bool,
}

impl Version {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: ProtocolVersion,
        their_ip: SocketAddr,
        their_services: PeerServices,
        our_services: PeerServices,
        our_ip: SocketAddr,
        nonce: Nonce,
        user_agent: String,
        start_height: block::Height,
        relay: bool,
    ) -> Version {
        // To try to stay within the range where peers will ignore our clock
        // skew, truncate the timestamp to the nearest 5 minutes.
        let now = Utc::now().timestamp();
        let timestamp = Utc.timestamp(now - now.rem_euclid(5 * 60), 0);
        Version {
            version,
            services: our_services,
            timestamp,
            address_recv: (their_services, their_ip),
            address_from: (our_services, our_ip),
            nonce,
            user_agent,
            start_height,
            relay,
        }
    }
}

impl BitcoinSerialize for Version {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut target)?;
        self.services.bitcoin_serialize(&mut target)?;
        self.timestamp.timestamp().bitcoin_serialize(&mut target)?;
        self.address_recv.bitcoin_serialize(&mut target)?;
        self.address_from.bitcoin_serialize(&mut target)?;
        self.nonce.bitcoin_serialize(&mut target)?;
        self.user_agent.bitcoin_serialize(&mut target)?;
        self.start_height.bitcoin_serialize(&mut target)?;
        self.relay.bitcoin_serialize(&mut target)?;
        Ok(())
    }
}

impl BitcoinDeserialize for Version {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Version {
            version: ProtocolVersion::bitcoin_deserialize(&mut reader)?,
            services: PeerServices::bitcoin_deserialize(&mut reader)?,
            timestamp: Utc.timestamp(i64::bitcoin_deserialize(&mut reader)?, 0),
            address_recv: <(PeerServices, SocketAddr)>::bitcoin_deserialize(&mut reader)?,
            address_from: <(PeerServices, SocketAddr)>::bitcoin_deserialize(&mut reader)?,
            nonce: Nonce::bitcoin_deserialize(&mut reader)?,
            user_agent: String::bitcoin_deserialize(&mut reader)?,
            start_height: block::Height::bitcoin_deserialize(&mut reader)?,
            // Peers older than BIP 37 end the message here; missing means
            // "relay everything".
            relay: bool::bitcoin_deserialize(&mut reader).unwrap_or(true),
        })
    }
}
