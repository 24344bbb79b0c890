//! # In-Process RPC Mesh
//!
//! [`MeshNet`] is the in-process rendition of the consumed DHT RPC layer: a
//! registry of nodes wired together with channels, honouring the
//! [`SwarmRpc`] contract (XOR-ordered k-closest query fan-out, per-hop
//! timeouts, round-trip tokens) without real routing tables. It backs
//! every multi-node test and simulation; production deployments substitute a
//! networked implementation of the same trait.
//!
//! ## Tokens
//!
//! Each node mints round-trip tokens for its repliers:
//! `token = BLAKE2b(ns ‖ secret ‖ requester-address)`. The secret rotates;
//! tokens minted under the previous secret stay valid for one grace window,
//! so a write that raced a rotation still lands.
//!
//! ## Model caveat
//!
//! The registry is fully converged: query iteration order *is* the global
//! k-closest order. Reflexive observations equal the registered socket
//! address, which is exact for the loopback deployments this mesh serves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::crypto::{namespaced_hash, NS_TOKEN};
use crate::holepunch::PROBE_MAGIC;
use crate::identity::{distance_cmp, Target};
use crate::messages::{Command, ErrorCode, NodeAddr, PeerAddress};
use crate::protocols::{Reply, RpcError, SwarmRpc};

/// Per-hop request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Nodes visited per query iteration.
pub const QUERY_WIDTH: usize = 20;

/// Parallelism of the query fan-out.
pub const QUERY_ALPHA: usize = 3;

/// Token secret rotation interval. Announce refresh loops run well inside
/// one window, so a token is never more than one rotation stale.
const TOKEN_ROTATE: Duration = Duration::from_secs(600);

/// Inbound-queue depth per node.
const INBOUND_QUEUE: usize = 64;

// ============================================================================
// Inbound requests
// ============================================================================

/// A request delivered to a node's handler loop.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: NodeAddr,
    pub command: Command,
    pub target: Target,
    /// The round-trip token the requester presented, if any.
    pub token: Option<[u8; 32]>,
    /// Whether that token is one we minted for this requester.
    pub token_ok: bool,
    pub value: Option<Vec<u8>>,
    /// Handlers reply or drop; dropping the sender encodes a silent drop.
    pub reply: oneshot::Sender<ReplyBody>,
}

/// Handler-produced reply body. The mesh attaches the round-trip token.
#[derive(Debug, Default)]
pub struct ReplyBody {
    pub value: Option<Vec<u8>>,
    pub error: Option<ErrorCode>,
}

impl ReplyBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn with_error(error: ErrorCode) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }
}

// ============================================================================
// Token minting
// ============================================================================

struct TokenSecrets {
    current: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
}

/// Mints and verifies round-trip tokens for one node.
struct TokenKeeper {
    secrets: Mutex<TokenSecrets>,
}

impl TokenKeeper {
    fn new() -> Self {
        let mut current = [0u8; 32];
        let mut previous = [0u8; 32];
        let _ = getrandom::getrandom(&mut current);
        let _ = getrandom::getrandom(&mut previous);
        Self {
            secrets: Mutex::new(TokenSecrets {
                current,
                previous,
                rotated_at: Instant::now(),
            }),
        }
    }

    fn derive(secret: &[u8; 32], requester: &SocketAddr) -> [u8; 32] {
        namespaced_hash(NS_TOKEN, &[secret, requester.to_string().as_bytes()])
    }

    async fn mint(&self, requester: &SocketAddr) -> [u8; 32] {
        let mut secrets = self.secrets.lock().await;
        if secrets.rotated_at.elapsed() > TOKEN_ROTATE {
            secrets.previous = secrets.current;
            let _ = getrandom::getrandom(&mut secrets.current);
            secrets.rotated_at = Instant::now();
        }
        Self::derive(&secrets.current, requester)
    }

    async fn verify(&self, requester: &SocketAddr, token: &[u8; 32]) -> bool {
        let secrets = self.secrets.lock().await;
        *token == Self::derive(&secrets.current, requester)
            || *token == Self::derive(&secrets.previous, requester)
    }
}

// ============================================================================
// Registry
// ============================================================================

struct MeshPeer {
    id: [u8; 32],
    inbound: mpsc::Sender<InboundRequest>,
    tokens: Arc<TokenKeeper>,
    /// Ephemeral nodes answer direct requests but are skipped by query
    /// iteration, like nodes absent from routing tables.
    ephemeral: bool,
}

/// Shared registry wiring all in-process nodes together.
#[derive(Clone, Default)]
pub struct MeshNet {
    peers: Arc<RwLock<HashMap<SocketAddr, Arc<MeshPeer>>>>,
}

impl MeshNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and hand back its RPC endpoint. Requests arriving for
    /// the node are delivered on `inbound`.
    pub async fn join(
        &self,
        local: NodeAddr,
        inbound: mpsc::Sender<InboundRequest>,
        ephemeral: bool,
    ) -> MeshRpc {
        let peer = Arc::new(MeshPeer {
            id: local.id,
            inbound,
            tokens: Arc::new(TokenKeeper::new()),
            ephemeral,
        });
        self.peers.write().await.insert(local.addr, peer);
        debug!(node = %hex::encode(&local.id[..8]), addr = %local.addr, "mesh join");
        MeshRpc {
            net: self.clone(),
            local,
        }
    }

    /// Remove a node. In-flight requests to it fail with `Unreachable`.
    pub async fn leave(&self, addr: SocketAddr) {
        self.peers.write().await.remove(&addr);
        debug!(%addr, "mesh leave");
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Inbound-channel capacity used by joining nodes.
    pub fn inbound_queue() -> usize {
        INBOUND_QUEUE
    }

    async fn peer(&self, addr: &SocketAddr) -> Option<Arc<MeshPeer>> {
        self.peers.read().await.get(addr).cloned()
    }

    /// All registered nodes except `exclude`, ordered by XOR distance of
    /// their ids to `target`.
    async fn closest(&self, target: &Target, exclude: &SocketAddr) -> Vec<NodeAddr> {
        let peers = self.peers.read().await;
        let mut nodes: Vec<NodeAddr> = peers
            .iter()
            .filter(|(addr, peer)| *addr != exclude && !peer.ephemeral)
            .map(|(addr, peer)| NodeAddr {
                id: peer.id,
                addr: *addr,
            })
            .collect();
        nodes.sort_by(|a, b| distance_cmp(target, &a.id, &b.id));
        nodes.truncate(QUERY_WIDTH);
        nodes
    }
}

// ============================================================================
// Per-node endpoint
// ============================================================================

/// One node's handle onto the mesh. Cheap to clone.
#[derive(Clone)]
pub struct MeshRpc {
    net: MeshNet,
    local: NodeAddr,
}

impl MeshRpc {
    async fn deliver(
        &self,
        to: &NodeAddr,
        command: Command,
        target: Target,
        value: Option<Vec<u8>>,
        token: Option<[u8; 32]>,
    ) -> Result<Reply, RpcError> {
        let Some(peer) = self.net.peer(&to.addr).await else {
            return Err(RpcError::Unreachable);
        };

        let token_ok = match &token {
            Some(t) => peer.tokens.verify(&self.local.addr, t).await,
            None => false,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = InboundRequest {
            from: self.local,
            command,
            target,
            token,
            token_ok,
            value,
            reply: reply_tx,
        };
        if peer.inbound.send(request).await.is_err() {
            return Err(RpcError::Unreachable);
        }

        // A handler that drops the reply sender is a silent drop; the
        // requester sees it as a timeout, same as on a real wire.
        let body = match timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => return Err(RpcError::Timeout),
            Err(_) => return Err(RpcError::Timeout),
        };

        let minted = peer.tokens.mint(&self.local.addr).await;
        Ok(Reply {
            from: NodeAddr {
                id: peer.id,
                addr: to.addr,
            },
            token: Some(minted),
            value: body.value,
            error: body.error,
        })
    }
}

#[async_trait]
impl SwarmRpc for MeshRpc {
    fn local(&self) -> NodeAddr {
        self.local
    }

    async fn query(
        &self,
        command: Command,
        target: Target,
        value: Option<Vec<u8>>,
    ) -> mpsc::Receiver<Reply> {
        let (tx, rx) = mpsc::channel(QUERY_WIDTH);
        let nodes = self.net.closest(&target, &self.local.addr).await;
        let this = self.clone();
        tokio::spawn(async move {
            trace!(
                target = %hex::encode(&target[..8]),
                nodes = nodes.len(),
                "query fan-out"
            );
            // Bounded-parallel iteration: alpha hops in flight, closest
            // first, replies forwarded in completion order.
            let mut pending = Vec::new();
            let mut nodes = nodes.into_iter();
            loop {
                while pending.len() < QUERY_ALPHA {
                    match nodes.next() {
                        Some(node) => {
                            let this = this.clone();
                            let value = value.clone();
                            pending.push(tokio::spawn(async move {
                                this.deliver(&node, command, target, value, None).await
                            }));
                        }
                        None => break,
                    }
                }
                if pending.is_empty() {
                    break;
                }
                let handle = pending.remove(0);
                match handle.await {
                    Ok(Ok(reply)) => {
                        if tx.send(reply).await.is_err() {
                            return;
                        }
                    }
                    Ok(Err(err)) => {
                        trace!(%err, "query hop failed");
                    }
                    Err(_) => {}
                }
            }
        });
        rx
    }

    async fn request(
        &self,
        to: NodeAddr,
        command: Command,
        target: Target,
        value: Option<Vec<u8>>,
        token: Option<[u8; 32]>,
    ) -> Result<Reply, RpcError> {
        self.deliver(&to, command, target, value, token).await
    }

    async fn ping_observed(&self, to: NodeAddr) -> Result<PeerAddress, RpcError> {
        if self.net.peer(&to.addr).await.is_none() {
            return Err(RpcError::Unreachable);
        }
        // In-process vantage: every peer observes our registered endpoint.
        PeerAddress::from_socket_addr(self.local.addr).ok_or(RpcError::Unreachable)
    }

    async fn probe_back(&self, to: NodeAddr, probe: PeerAddress) -> Result<(), RpcError> {
        if self.net.peer(&to.addr).await.is_none() {
            return Err(RpcError::Unreachable);
        }
        tokio::spawn(async move {
            match UdpSocket::bind("127.0.0.1:0").await {
                Ok(socket) => {
                    if let Err(err) = socket.send_to(PROBE_MAGIC, probe.socket_addr()).await {
                        warn!(%err, "probe-back send failed");
                    }
                }
                Err(err) => warn!(%err, "probe-back bind failed"),
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.net.leave(self.local.addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn node_addr(id_byte: u8, port: u16) -> NodeAddr {
        NodeAddr {
            id: [id_byte; 32],
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
        }
    }

    async fn echo_node(net: &MeshNet, id_byte: u8, port: u16) -> NodeAddr {
        let addr = node_addr(id_byte, port);
        let (tx, mut rx) = mpsc::channel(MeshNet::inbound_queue());
        net.join(addr, tx, false).await;
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.reply.send(ReplyBody::with_value(vec![req.from.id[0]]));
            }
        });
        addr
    }

    #[tokio::test]
    async fn request_round_trips_and_carries_a_token() {
        let net = MeshNet::new();
        let server = echo_node(&net, 2, 1002).await;
        let (tx, _rx) = mpsc::channel(1);
        let client = net.join(node_addr(1, 1001), tx, true).await;

        let reply = client
            .request(server, Command::Lookup, [0u8; 32], None, None)
            .await
            .expect("reply");
        assert_eq!(reply.value, Some(vec![1]));
        assert!(reply.token.is_some());
        assert_eq!(reply.from.id, [2u8; 32]);
    }

    #[tokio::test]
    async fn tokens_verify_only_for_the_requester_they_were_minted_for() {
        let net = MeshNet::new();
        let server = echo_node(&net, 9, 1009).await;
        let (tx_a, _rx_a) = mpsc::channel(1);
        let a = net.join(node_addr(1, 1101), tx_a, true).await;
        let (tx_b, _rx_b) = mpsc::channel(1);
        let b = net.join(node_addr(2, 1102), tx_b, true).await;

        let token = a
            .request(server, Command::Lookup, [0u8; 32], None, None)
            .await
            .unwrap()
            .token
            .unwrap();

        let peer = net.peer(&server.addr).await.unwrap();
        assert!(peer.tokens.verify(&a.local().addr, &token).await);
        assert!(!peer.tokens.verify(&b.local().addr, &token).await);
    }

    #[tokio::test]
    async fn presented_tokens_are_flagged_for_handlers() {
        let net = MeshNet::new();
        let responder = node_addr(9, 1409);
        let (tx, mut rx) = mpsc::channel(MeshNet::inbound_queue());
        net.join(responder, tx, false).await;
        let seen = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let seen_task = seen.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                seen_task.lock().await.push(req.token_ok);
                let _ = req.reply.send(ReplyBody::empty());
            }
        });

        let (tx, _rx) = mpsc::channel(1);
        let client = net.join(node_addr(1, 1401), tx, true).await;
        let token = client
            .request(responder, Command::Lookup, [0u8; 32], None, None)
            .await
            .unwrap()
            .token
            .unwrap();

        // A minted token verifies; a fabricated one does not.
        client
            .request(responder, Command::Announce, [0u8; 32], None, Some(token))
            .await
            .unwrap();
        client
            .request(responder, Command::Announce, [0u8; 32], None, Some([0u8; 32]))
            .await
            .unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.as_slice(), &[false, true, false]);
    }

    #[tokio::test]
    async fn query_visits_nodes_in_distance_order() {
        let net = MeshNet::new();
        // ids 0x10, 0x20, 0x40: distance to target 0x00.. orders them
        // 0x10 < 0x20 < 0x40.
        for (byte, port) in [(0x40u8, 1201u16), (0x10, 1202), (0x20, 1203)] {
            echo_node(&net, byte, port).await;
        }
        let (tx, _rx) = mpsc::channel(1);
        let client = net.join(node_addr(1, 1204), tx, true).await;

        let mut rx = client.query(Command::Lookup, [0u8; 32], None).await;
        let mut order = Vec::new();
        while let Some(reply) = rx.recv().await {
            order.push(reply.from.id[0]);
        }
        assert_eq!(order.len(), 3);
        // With alpha-parallel delivery completion order can interleave, but
        // the closest node is dispatched first and loopback replies resolve
        // in dispatch order here.
        assert_eq!(order[0], 0x10);
    }

    #[tokio::test]
    async fn unreachable_nodes_error() {
        let net = MeshNet::new();
        let (tx, _rx) = mpsc::channel(1);
        let client = net.join(node_addr(1, 1301), tx, true).await;
        let gone = node_addr(9, 1399);
        assert_eq!(
            client
                .request(gone, Command::Lookup, [0u8; 32], None, None)
                .await
                .unwrap_err(),
            RpcError::Unreachable
        );

        client.close().await;
        assert!(net.is_empty().await);
    }
}
