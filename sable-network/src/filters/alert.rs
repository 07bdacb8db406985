//! The signed-alert relay filter.

use std::collections::HashMap;

use chrono::Utc;
use secp256k1::PublicKey;
use tracing::{debug, info, warn};

use crate::peer::PeerId;
use crate::protocol::external::message::{Alert, AlertPayload};
use crate::protocol::external::types::ProtocolVersion;
use crate::protocol::external::{Command, Message};

use super::{FilterContext, FilterError, MessageFilter};

/// Verifies, stores, and relays signed network alerts.
pub struct AlertFilter {
    /// The chain operator's alert key; `None` disables alert processing.
    pub_key: Option<PublicKey>,
    /// Our own version/user-agent, so alerts aimed at us are still relayed
    /// even when the receiving peer doesn't match.
    version: ProtocolVersion,
    sub_version: String,
    /// Verified, in-effect alerts by payload hash.
    alerts: HashMap<[u8; 32], (Alert, AlertPayload)>,
    /// Callbacks invoked for every newly effective alert, in registration
    /// order.
    handlers: Vec<Box<dyn FnMut(&AlertPayload) + Send>>,
}

const COMMANDS: [Command; 2] = [Command::Alert, Command::Version];

impl AlertFilter {
    pub fn new(
        pub_key: Option<PublicKey>,
        version: ProtocolVersion,
        sub_version: String,
    ) -> AlertFilter {
        AlertFilter {
            pub_key,
            version,
            sub_version,
            alerts: HashMap::new(),
            handlers: Vec::new(),
        }
    }

    /// Register a callback for newly effective alerts.
    pub fn add_handler(&mut self, handler: Box<dyn FnMut(&AlertPayload) + Send>) {
        self.handlers.push(handler);
    }

    /// Whether `payload` should be forwarded to a peer with the given
    /// version and user agent.
    fn should_relay_to(&self, payload: &AlertPayload, version: ProtocolVersion, sub_ver: &str) -> bool {
        payload.applies_to(version, sub_ver)
            || payload.applies_to(self.version, &self.sub_version)
            || payload.should_relay(Utc::now())
    }

    fn handle_alert(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        alert: &Alert,
    ) -> Result<bool, FilterError> {
        ctx.require_version(&origin)?;
        let pub_key = match &self.pub_key {
            Some(pub_key) => pub_key,
            None => return Ok(false),
        };

        if !alert.verify(pub_key) {
            // Unsigned alert spam is dropped without honoring it; the
            // framing was fine, so the peer stays.
            warn!(%origin, "dropping alert with a bad signature");
            return Ok(false);
        }
        let payload = alert
            .payload()
            .map_err(|e| FilterError::Malformed(e.to_string()))?;

        let hash = alert.hash();
        if let Some(peer) = ctx.peers.get_mut(&origin) {
            peer.record_alert(hash);
        }
        if self.alerts.contains_key(&hash) {
            return Ok(true);
        }

        let now = Utc::now();
        if !payload.is_in_effect(now) {
            debug!(id = payload.id, "ignoring expired alert");
            return Ok(true);
        }
        if self
            .alerts
            .values()
            .any(|(_, existing)| existing.cancels(&payload))
        {
            debug!(id = payload.id, "ignoring alert cancelled in advance");
            return Ok(true);
        }

        // A newly effective alert first cancels its predecessors.
        self.alerts
            .retain(|_, (_, existing)| !payload.cancels(existing));
        info!(id = payload.id, status = %payload.status_bar, "alert is in effect");
        for handler in self.handlers.iter_mut() {
            handler(&payload);
        }

        for peer in ctx.peers.ready_peers_mut() {
            if peer.addr == origin {
                continue;
            }
            let applies = self.should_relay_to(&payload, peer.version, &peer.user_agent);
            if applies && peer.record_alert(hash) {
                peer.push_message(Message::Alert(alert.clone()));
            }
        }
        self.alerts.insert(hash, (alert.clone(), payload));
        Ok(true)
    }

    /// Send every effective alert to a peer that just announced its
    /// version.
    fn handle_version(&mut self, ctx: &mut FilterContext<'_>, origin: PeerId) -> bool {
        let now = Utc::now();
        let peer = match ctx.peers.get_mut(&origin) {
            Some(peer) => peer,
            None => return false,
        };
        for (hash, (alert, payload)) in self.alerts.iter() {
            if !payload.is_in_effect(now) {
                continue;
            }
            if payload.applies_to(peer.version, &peer.user_agent)
                || payload.applies_to(self.version, &self.sub_version)
            {
                if peer.record_alert(*hash) {
                    peer.push_message(Message::Alert(alert.clone()));
                }
            }
        }
        true
    }
}

impl MessageFilter for AlertFilter {
    fn commands(&self) -> &'static [Command] {
        &COMMANDS
    }

    fn apply(
        &mut self,
        ctx: &mut FilterContext<'_>,
        origin: PeerId,
        message: &Message,
    ) -> Result<bool, FilterError> {
        match message {
            Message::Alert(alert) => self.handle_alert(ctx, origin, alert),
            Message::Version(_) => Ok(self.handle_version(ctx, origin)),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::TestNet;
    use sable_chain::BitcoinSerialize;
    use secp256k1::{Message as SecpMessage, Secp256k1};

    fn payload(id: i32) -> AlertPayload {
        AlertPayload {
            version: 1,
            relay_until: 4_000_000_000,
            expiration: 4_000_000_000,
            id,
            cancel: 0,
            set_cancel: vec![],
            min_ver: 0,
            max_ver: 1_000_000,
            set_sub_ver: vec![],
            priority: 1,
            comment: String::new(),
            status_bar: "upgrade".to_owned(),
            reserved: String::new(),
        }
    }

    fn signed(payload: &AlertPayload) -> Alert {
        let secp = Secp256k1::new();
        let mut alert = Alert {
            payload: payload.bitcoin_serialize_to_vec().unwrap(),
            signature: vec![],
        };
        let digest = SecpMessage::from_slice(&alert.hash()).unwrap();
        alert.signature = secp
            .sign(&digest, &TestNet::alert_secret_key())
            .serialize_der()
            .to_vec();
        alert
    }

    #[test]
    fn valid_alerts_are_relayed_to_applicable_peers() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        let other = net.add_ready_peer();

        let alert = signed(&payload(7));
        net.dispatch(origin, &Message::Alert(alert.clone())).unwrap();

        let sent = net.sent_messages(other);
        assert!(sent.iter().any(|m| matches!(m, Message::Alert(a) if *a == alert)));
        // The origin is not echoed its own alert.
        let sent = net.sent_messages(origin);
        assert!(!sent.iter().any(|m| matches!(m, Message::Alert(_))));
    }

    #[test]
    fn tampered_alerts_are_dropped() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();
        let other = net.add_ready_peer();

        let mut alert = signed(&payload(8));
        alert.payload[0] ^= 1;
        let handled = net.dispatch(origin, &Message::Alert(alert)).unwrap();
        assert!(!handled);
        assert!(net.peers.contains(&origin));
        assert!(!net
            .sent_messages(other)
            .iter()
            .any(|m| matches!(m, Message::Alert(_))));
    }

    #[test]
    fn effective_alerts_greet_new_peers() {
        sable_test::init();
        let mut net = TestNet::new();
        let origin = net.add_ready_peer();

        let alert = signed(&payload(9));
        net.dispatch(origin, &Message::Alert(alert.clone())).unwrap();

        // A later peer learns the alert as soon as it announces a version.
        let late = net.add_inbound_peer();
        let version = net.remote_version(crate::protocol::external::types::Nonce(5), 0);
        net.dispatch(late, &Message::Version(version)).unwrap();
        let sent = net.sent_messages(late);
        assert!(sent.iter().any(|m| matches!(m, Message::Alert(a) if *a == alert)));
    }
}
