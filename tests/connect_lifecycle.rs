//! Integration tests for connection establishment.
//!
//! Three-node testnets over the in-process mesh: a bootstrap node, a server
//! node and a client node, with real loopback UDP for the hole-punch and
//! stream layers.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test connect_lifecycle -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use burrow::{
    keypair, ConnectError, ConnectOptions, Dht, DhtOptions, MeshNet, ServerOptions,
};
use tokio::time::timeout;

/// One-time tracing initialization. Use RUST_LOG=debug for verbose output.
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const SHORT_TIMEOUT: Duration = Duration::from_secs(1);

/// A converged testnet of `n` nodes, created in join order so every node
/// classifies its firewall against already-present peers.
async fn testnet(n: usize) -> (MeshNet, Vec<Dht>) {
    init_tracing();
    let net = MeshNet::new();
    let mut nodes = Vec::new();
    for _ in 0..n {
        let dht = Dht::bind(&net, DhtOptions::default())
            .await
            .expect("bind failed");
        dht.ready().await.expect("ready failed");
        nodes.push(dht);
    }
    (net, nodes)
}

async fn destroy_all(nodes: &[Dht]) {
    for node in nodes {
        node.destroy().await;
    }
}

#[tokio::test]
async fn basic_connect_end_to_end() {
    let (_net, nodes) = testnet(3).await;
    let (z, a, b) = (&nodes[0], &nodes[1], &nodes[2]);

    assert!(a.port() > 0, "bound nodes expose a real port");
    // Quick classification never proves an open firewall, so a ready node
    // still reports itself firewalled.
    assert!(a.firewalled());

    let seed = [b's'; 32];
    let server = a
        .create_server(ServerOptions {
            keypair: Some(keypair(Some(seed))),
            ..Default::default()
        })
        .await
        .expect("create_server failed");
    timeout(TEST_TIMEOUT, server.listen())
        .await
        .expect("listen timed out")
        .expect("listen failed");

    let target = server.public_key().target();
    assert_eq!(
        z.announces_for(target).await,
        1,
        "the bootstrap node should hold exactly one announce for the server"
    );

    let socket = b
        .connect(server.public_key(), ConnectOptions::default())
        .await;
    timeout(TEST_TIMEOUT, socket.wait_open())
        .await
        .expect("open timed out")
        .expect("open failed");

    let accepted = timeout(TEST_TIMEOUT, server.accept())
        .await
        .expect("accept timed out")
        .expect("server closed before accepting");
    assert_eq!(accepted.remote_public_key(), b.default_keypair().identity());
    assert_eq!(socket.remote_public_key(), server.public_key());

    socket.write(b"ping").await.expect("write failed");
    assert_eq!(accepted.recv().await.unwrap(), b"ping");
    accepted.write(b"pong").await.expect("write failed");
    assert_eq!(socket.recv().await.unwrap(), b"pong");

    socket.end().await;
    accepted.end().await;
    timeout(TEST_TIMEOUT, socket.closed())
        .await
        .expect("client close timed out");
    timeout(TEST_TIMEOUT, accepted.closed())
        .await
        .expect("server close timed out");
    assert!(socket.error().is_none());
    assert!(accepted.error().is_none());

    server.close().await;
    server.close().await; // Double close is a no-op.
    destroy_all(&nodes).await;
}

#[tokio::test]
async fn server_hook_abort_surfaces_to_the_client() {
    let (_net, nodes) = testnet(3).await;
    let (a, b) = (&nodes[1], &nodes[2]);

    let server = a
        .create_server(ServerOptions {
            holepunch: Some(Arc::new(|_, _, _, _| false)),
            ..Default::default()
        })
        .await
        .unwrap();
    server.listen().await.unwrap();

    let socket = b
        .connect(server.public_key(), ConnectOptions::default())
        .await;
    let err = timeout(TEST_TIMEOUT, socket.wait_open())
        .await
        .expect("open timed out")
        .expect_err("open should fail");
    assert_eq!(err, ConnectError::HolepunchAborted);

    // The admission never completes, so no connection is delivered.
    assert!(timeout(SHORT_TIMEOUT, server.accept()).await.is_err());

    server.close().await;
    destroy_all(&nodes).await;
}

#[tokio::test]
async fn client_hook_abort_is_symmetric() {
    let (_net, nodes) = testnet(3).await;
    let (a, b) = (&nodes[1], &nodes[2]);

    let server = a.create_server(ServerOptions::default()).await.unwrap();
    server.listen().await.unwrap();

    let socket = b
        .connect(
            server.public_key(),
            ConnectOptions {
                holepunch: Some(Arc::new(|_, _, _, _| false)),
                ..Default::default()
            },
        )
        .await;
    let err = timeout(TEST_TIMEOUT, socket.wait_open())
        .await
        .expect("open timed out")
        .expect_err("open should fail");
    assert_eq!(err, ConnectError::HolepunchAborted);

    assert!(timeout(SHORT_TIMEOUT, server.accept()).await.is_err());

    server.close().await;
    destroy_all(&nodes).await;
}

#[tokio::test]
async fn ten_concurrent_connects_fan_in() {
    let (_net, nodes) = testnet(3).await;
    let (a, b) = (&nodes[1], &nodes[2]);

    let server = Arc::new(a.create_server(ServerOptions::default()).await.unwrap());
    server.listen().await.unwrap();

    // The server ends every connection immediately with a greeting.
    let served = Arc::new(AtomicUsize::new(0));
    let acceptor = {
        let server = server.clone();
        let served = served.clone();
        tokio::spawn(async move {
            while let Some(socket) = server.accept().await {
                served.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    socket.write(b"hi").await.ok();
                    socket.end().await;
                    socket.closed().await;
                });
            }
        })
    };

    let mut clients = Vec::new();
    for _ in 0..10 {
        let socket = b
            .connect(
                server.public_key(),
                ConnectOptions {
                    keypair: Some(keypair(None)),
                    ..Default::default()
                },
            )
            .await;
        clients.push(socket);
    }

    for socket in &clients {
        timeout(TEST_TIMEOUT, socket.wait_open())
            .await
            .expect("open timed out")
            .expect("open failed");
        assert_eq!(
            timeout(TEST_TIMEOUT, socket.recv())
                .await
                .expect("recv timed out")
                .expect("expected greeting"),
            b"hi"
        );
        // Remote ended; drain to end-of-stream, end our side, close.
        assert!(socket.recv().await.is_none());
        socket.end().await;
        timeout(TEST_TIMEOUT, socket.closed())
            .await
            .expect("close timed out");
    }
    assert_eq!(served.load(Ordering::SeqCst), 10);

    server.close().await;
    acceptor.abort();
    destroy_all(&nodes).await;
}

#[tokio::test]
async fn closed_servers_unannounce_everywhere() {
    let (_net, nodes) = testnet(3).await;
    let (z, a, b) = (&nodes[0], &nodes[1], &nodes[2]);

    let server = a.create_server(ServerOptions::default()).await.unwrap();
    server.listen().await.unwrap();
    let public_key = server.public_key();
    assert_eq!(z.announces_for(public_key.target()).await, 1);

    server.close().await;
    assert_eq!(
        z.announces_for(public_key.target()).await,
        0,
        "unannounce should clear the record"
    );

    let socket = b.connect(public_key, ConnectOptions::default()).await;
    let err = timeout(TEST_TIMEOUT, socket.wait_open())
        .await
        .expect("open timed out")
        .expect_err("the server is gone");
    assert_eq!(err, ConnectError::PeerNotFound);

    destroy_all(&nodes).await;
}

#[tokio::test]
async fn ephemeral_nodes_store_nothing() {
    init_tracing();
    let net = MeshNet::new();
    let z = Dht::bind(&net, DhtOptions::default()).await.unwrap();
    let ephemeral = Dht::bind(
        &net,
        DhtOptions {
            ephemeral: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let a = Dht::bind(&net, DhtOptions::default()).await.unwrap();

    let server = a.create_server(ServerOptions::default()).await.unwrap();
    server.listen().await.unwrap();

    let target = server.public_key().target();
    assert_eq!(z.announces_for(target).await, 1);
    assert_eq!(
        ephemeral.announces_for(target).await,
        0,
        "announces must skip ephemeral nodes"
    );

    server.close().await;
    for node in [z, ephemeral, a] {
        node.destroy().await;
    }
}

#[tokio::test]
async fn destroy_is_idempotent_and_fails_new_work() {
    let (_net, nodes) = testnet(2).await;
    let a = &nodes[0];

    a.destroy().await;
    a.destroy().await;

    assert!(a.create_server(ServerOptions::default()).await.is_err());
    let socket = a
        .connect(keypair(None).identity(), ConnectOptions::default())
        .await;
    assert_eq!(
        socket.wait_open().await.unwrap_err(),
        ConnectError::Closed
    );

    destroy_all(&nodes).await;
}
