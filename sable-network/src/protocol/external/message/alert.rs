use chrono::{DateTime, TimeZone, Utc};
use sable_serde_derive::{BtcDeserialize, BtcSerialize};
use secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, Signature};

use sable_chain::serialization::sha256d;
use sable_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::super::types::ProtocolVersion;

/// An `alert` message: a serialized [`AlertPayload`] plus an ECDSA
/// signature over its double-SHA256, made with the chain operator's alert
/// key.
#[derive(BtcDeserialize, BtcSerialize, Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// The serialized payload. Kept as raw bytes so the signature check
    /// covers exactly what was signed, byte for byte.
    pub payload: Vec<u8>,
    /// A DER-encoded signature over `sha256d(payload)`.
    pub signature: Vec<u8>,
}

impl Alert {
    /// The hash identifying this alert (and the digest its signature
    /// covers).
    pub fn hash(&self) -> [u8; 32] {
        use std::io::Write;
        let mut writer = sha256d::Writer::default();
        writer
            .write_all(&self.payload)
            .expect("writing to a hash writer is infallible");
        writer.finish()
    }

    /// Check the signature against the configured alert public key.
    pub fn verify(&self, pubkey: &PublicKey) -> bool {
        let secp = Secp256k1::verification_only();
        let digest =
            SecpMessage::from_slice(&self.hash()).expect("a 32-byte digest is a valid message");
        match Signature::from_der(&self.signature) {
            Ok(signature) => secp.verify(&digest, &signature, pubkey).is_ok(),
            Err(_) => false,
        }
    }

    /// Deserialize the signed payload.
    pub fn payload(&self) -> Result<AlertPayload, SerializationError> {
        AlertPayload::bitcoin_deserialize(&self.payload[..])
    }
}

/// The signed content of an `alert` message.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#alert)
#[derive(BtcDeserialize, BtcSerialize, Debug, Clone, PartialEq, Eq)]
pub struct AlertPayload {
    /// The alert format version.
    pub version: i32,
    /// Relay the alert to other peers until this Unix time.
    pub relay_until: i64,
    /// The alert stops being shown after this Unix time.
    pub expiration: i64,
    /// A unique alert id.
    pub id: i32,
    /// Alerts with ids up to and including this value are cancelled.
    pub cancel: i32,
    /// Specific alert ids that are cancelled.
    pub set_cancel: Vec<i32>,
    /// The lowest protocol version the alert applies to.
    pub min_ver: i32,
    /// The highest protocol version the alert applies to.
    pub max_ver: i32,
    /// User-agent strings the alert applies to; empty means all.
    pub set_sub_ver: Vec<String>,
    /// Relative priority among active alerts.
    pub priority: i32,
    /// A comment not intended for display.
    pub comment: String,
    /// The status text shown to node operators.
    pub status_bar: String,
    /// Reserved for future use.
    pub reserved: String,
}

impl AlertPayload {
    pub fn expiration_time(&self) -> DateTime<Utc> {
        Utc.timestamp(self.expiration, 0)
    }

    /// Whether the alert is still in effect at `now`.
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        now < self.expiration_time()
    }

    /// Whether the alert should still be relayed at `now`.
    pub fn should_relay(&self, now: DateTime<Utc>) -> bool {
        self.is_in_effect(now) && now < Utc.timestamp(self.relay_until, 0)
    }

    /// Whether the alert applies to a peer with the given protocol version
    /// and user agent.
    pub fn applies_to(&self, version: ProtocolVersion, sub_ver: &str) -> bool {
        let in_range =
            self.min_ver <= version.0 as i32 && version.0 as i32 <= self.max_ver;
        in_range && (self.set_sub_ver.is_empty() || self.set_sub_ver.iter().any(|v| v == sub_ver))
    }

    /// Whether this alert cancels `other`.
    pub fn cancels(&self, other: &AlertPayload) -> bool {
        other.id <= self.cancel || self.set_cancel.contains(&other.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn payload() -> AlertPayload {
        AlertPayload {
            version: 1,
            relay_until: 4_000_000_000,
            expiration: 4_000_000_000,
            id: 1001,
            cancel: 1000,
            set_cancel: vec![42],
            min_ver: 209,
            max_ver: 70_001,
            set_sub_ver: vec![],
            priority: 100,
            comment: String::new(),
            status_bar: "URGENT: upgrade required".to_owned(),
            reserved: String::new(),
        }
    }

    fn signed_alert(payload: &AlertPayload, key: &SecretKey) -> Alert {
        let secp = Secp256k1::new();
        let bytes = payload
            .bitcoin_serialize_to_vec()
            .expect("serializing into a vec never fails");
        let mut alert = Alert {
            payload: bytes,
            signature: vec![],
        };
        let digest = SecpMessage::from_slice(&alert.hash()).unwrap();
        alert.signature = secp.sign(&digest, key).serialize_der().to_vec();
        alert
    }

    #[test]
    fn signature_verifies_and_tampering_is_detected() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key);

        let alert = signed_alert(&payload(), &key);
        assert!(alert.verify(&pubkey));
        assert_eq!(alert.payload().unwrap(), payload());

        let mut tampered = alert.clone();
        tampered.payload[0] ^= 0x01;
        assert!(!tampered.verify(&pubkey));
    }

    #[test]
    fn applicability_rules() {
        let current = payload();
        let now = Utc.timestamp(1_600_000_000, 0);
        assert!(current.is_in_effect(now));
        assert!(current.applies_to(ProtocolVersion(70_001), "/sable:1.0.0-alpha/"));
        assert!(!current.applies_to(ProtocolVersion(70_002), "/sable:1.0.0-alpha/"));

        let mut old = payload();
        old.id = 999;
        assert!(current.cancels(&old));
        old.id = 1002;
        assert!(!current.cancels(&old));
        old.id = 42;
        assert!(current.cancels(&old));
    }
}
