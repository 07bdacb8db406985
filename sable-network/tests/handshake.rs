//! End-to-end handshake tests: a real node on a real socket, driven by a
//! hand-rolled peer speaking through the codec.

use std::net::SocketAddr;
use std::time::Duration;

use futures::prelude::*;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use sable_chain::block::Height;
use sable_chain::parameters::{genesis_hash, Network};
use sable_network::protocol::external::message::Version;
use sable_network::protocol::external::types::{Nonce, PeerServices};
use sable_network::{Codec, Config, InventoryHash, Message, Node};
use sable_state::ChainState;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Grab an ephemeral port the node can immediately rebind.
fn reserve_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("ephemeral bind succeeds");
    listener.local_addr().expect("bound socket has an address")
}

fn test_config(listen_addr: SocketAddr) -> Config {
    Config {
        listen_addr,
        network: Network::Regtest,
        initial_peers: Vec::new(),
        target_outbound_peers: 0,
        user_agent: "/sable-test:0.0/".to_owned(),
        relay: true,
        alert_key: String::new(),
    }
}

async fn next_message<R>(reader: &mut R) -> Message
where
    R: Stream<Item = Result<Message, sable_chain::SerializationError>> + Unpin,
{
    timeout(IO_TIMEOUT, reader.next())
        .await
        .expect("node responds within the timeout")
        .expect("stream stays open")
        .expect("message decodes")
}

#[tokio::test]
async fn inbound_handshake_and_block_serving() {
    sable_test::init();

    let listen_addr = reserve_port();
    let (node, shutdown) = Node::new(
        test_config(listen_addr),
        Box::new(ChainState::new(Network::Regtest)),
    );
    let node_task = tokio::spawn(node.run());

    // Give the listener a moment to come up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stream = timeout(IO_TIMEOUT, TcpStream::connect(listen_addr))
        .await
        .expect("connect does not hang")
        .expect("the node is listening");
    let (read_half, write_half) = stream.into_split();
    let codec = || Codec::builder().for_network(Network::Regtest).finish();
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    // We dialed, so we speak first.
    let our_version = Version::new(
        sable_network::constants::CURRENT_VERSION,
        listen_addr,
        PeerServices::NODE_NETWORK,
        PeerServices::NODE_NETWORK,
        "127.0.0.1:0".parse().unwrap(),
        Nonce(0xAAAA),
        "/peer:0.1/".to_owned(),
        Height(0),
        true,
    );
    writer
        .send(Message::Version(our_version))
        .await
        .expect("version sends");

    // The node answers with its own version, then verack.
    let their_version = match next_message(&mut reader).await {
        Message::Version(version) => version,
        other => panic!("expected version, got {}", other),
    };
    assert_eq!(their_version.user_agent, "/sable-test:0.0/");
    assert!(matches!(next_message(&mut reader).await, Message::Verack));

    writer.send(Message::Verack).await.expect("verack sends");

    // Once ready, the node asks where our chain is.
    assert!(matches!(
        next_message(&mut reader).await,
        Message::GetBlocks(_)
    ));

    // A ready session serves data: ping/pong and block requests.
    writer
        .send(Message::Ping(Nonce(7)))
        .await
        .expect("ping sends");
    assert!(matches!(
        next_message(&mut reader).await,
        Message::Pong(Nonce(7))
    ));

    let genesis = genesis_hash(Network::Regtest);
    writer
        .send(Message::GetData(vec![InventoryHash::Block(genesis)]))
        .await
        .expect("getdata sends");
    match next_message(&mut reader).await {
        Message::Block(block) => assert_eq!(block.hash(), genesis),
        other => panic!("expected the genesis block, got {}", other),
    }

    shutdown.shutdown();
    timeout(IO_TIMEOUT, node_task)
        .await
        .expect("the node shuts down promptly")
        .expect("the node task does not panic")
        .expect("the node exits cleanly");
}

#[tokio::test]
async fn messages_before_version_are_dropped_without_disconnect() {
    sable_test::init();

    let listen_addr = reserve_port();
    let (node, shutdown) = Node::new(
        test_config(listen_addr),
        Box::new(ChainState::new(Network::Regtest)),
    );
    let node_task = tokio::spawn(node.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stream = TcpStream::connect(listen_addr)
        .await
        .expect("the node is listening");
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        Codec::builder().for_network(Network::Regtest).finish(),
    );
    let mut writer = FramedWrite::new(
        write_half,
        Codec::builder().for_network(Network::Regtest).finish(),
    );

    // An early getaddr violates the handshake order; it must be ignored,
    // not punished.
    writer.send(Message::GetAddr).await.expect("getaddr sends");

    let our_version = Version::new(
        sable_network::constants::CURRENT_VERSION,
        listen_addr,
        PeerServices::NODE_NETWORK,
        PeerServices::NODE_NETWORK,
        "127.0.0.1:0".parse().unwrap(),
        Nonce(0xBBBB),
        "/peer:0.1/".to_owned(),
        Height(0),
        true,
    );
    writer
        .send(Message::Version(our_version))
        .await
        .expect("version sends");

    // The session survived: the handshake proceeds normally.
    assert!(matches!(
        next_message(&mut reader).await,
        Message::Version(_)
    ));
    assert!(matches!(next_message(&mut reader).await, Message::Verack));

    shutdown.shutdown();
    let _ = timeout(IO_TIMEOUT, node_task).await;
}
