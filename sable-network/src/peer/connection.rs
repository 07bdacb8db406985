//! The per-connection IO task.
//!
//! Each task owns one socket. Decoded messages flow to the event loop over
//! the shared event channel; outgoing messages arrive over the session's
//! outbox channel and are framed in enqueue order. The task never touches
//! peer state, which belongs to the event loop.

use futures::prelude::*;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use sable_chain::parameters::Network;

use super::{DisconnectReason, Link, PeerId};
use crate::protocol::external::{Codec, Message};

/// Events a connection task reports to the node's event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// The connection is up and its outbox is ready.
    Connected {
        peer: PeerId,
        link: Link,
        outbox: mpsc::UnboundedSender<Message>,
    },
    /// A message arrived from the peer.
    Message { peer: PeerId, message: Message },
    /// The connection ended; the task has exited.
    Closed {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// An outbound dial failed before a connection existed.
    DialFailed { addr: PeerId, error: String },
}

/// Spawn the IO task for an established connection.
///
/// The task signals `Connected` with the session's outbox, then pumps
/// messages both ways until either side closes. Dropping the outbox sender
/// makes the task flush and exit, which is how the event loop stops a peer.
pub fn spawn_connection(
    stream: TcpStream,
    link: Link,
    network: Network,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let peer: PeerId = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "accepted socket had no peer address");
            return;
        }
    };

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Message>();
    if events
        .send(PeerEvent::Connected {
            peer,
            link,
            outbox: outbox_tx,
        })
        .is_err()
    {
        // The node is gone; nothing to do.
        return;
    }

    tokio::spawn(run_connection(stream, peer, network, events, outbox_rx));
}

async fn run_connection(
    stream: TcpStream,
    peer: PeerId,
    network: Network,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut peer_rx = FramedRead::new(
        read_half,
        Codec::builder()
            .for_network(network)
            .with_metrics_label(peer.to_string())
            .finish(),
    );
    let mut peer_tx = FramedWrite::new(
        write_half,
        Codec::builder()
            .for_network(network)
            .with_metrics_label(peer.to_string())
            .finish(),
    );

    let reason = loop {
        tokio::select! {
            incoming = peer_rx.next() => match incoming {
                Some(Ok(message)) => {
                    trace!(%peer, %message, "received message");
                    if events
                        .send(PeerEvent::Message { peer, message })
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Err(error)) => break DisconnectReason::Codec(error.to_string()),
                None => break DisconnectReason::ConnectionClosed,
            },
            outgoing = outbox_rx.recv() => match outgoing {
                Some(message) => {
                    trace!(%peer, %message, "sending message");
                    if let Err(error) = peer_tx.send(message).await {
                        break DisconnectReason::Io(error.to_string());
                    }
                }
                // The event loop dropped the session; close quietly.
                None => break DisconnectReason::Shutdown,
            },
        }
    };

    let _ = events.send(PeerEvent::Closed { peer, reason });
}
