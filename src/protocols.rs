//! Protocol trait definitions for the overlay's networking seam.
//!
//! The Kademlia routing layer is an external collaborator: the overlay only
//! consumes iterative queries, single-hop requests, and the reflexive
//! observations needed for firewall classification. [`SwarmRpc`] captures
//! exactly that surface so the record store, servers and connectors never
//! depend on a concrete transport.
//!
//! ## Design
//!
//! - `query` performs the iterative k-closest fan-out and streams replies
//!   back; each reply carries the responding node's address and a round-trip
//!   token that later signed writes must commit to.
//! - `request` is a single targeted hop, used for announces to known storers
//!   and for relay negotiation.
//! - `ping_observed` / `probe_back` expose the reflexive-address machinery
//!   the hole-puncher's firewall classifier needs.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::Target;
use crate::messages::{Command, ErrorCode, NodeAddr, PeerAddress};

/// A reply surfaced by [`SwarmRpc::query`] or [`SwarmRpc::request`].
#[derive(Clone, Debug)]
pub struct Reply {
    /// The node that answered.
    pub from: NodeAddr,
    /// Round-trip token minted by the responder; signed writes sent back to
    /// this node must commit to it.
    pub token: Option<[u8; 32]>,
    /// Reply payload; `None` encodes an empty reply.
    pub value: Option<Vec<u8>>,
    /// Typed wire error, when the handler returned one.
    pub error: Option<ErrorCode>,
}

/// Transport-level failures. Wire-level errors travel in [`Reply::error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcError {
    /// The destination is not reachable (unknown or gone).
    Unreachable,
    /// No reply within the per-hop timeout.
    Timeout,
    /// The local node is shutting down.
    Closed,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Unreachable => write!(f, "destination unreachable"),
            RpcError::Timeout => write!(f, "request timed out"),
            RpcError::Closed => write!(f, "rpc layer closed"),
        }
    }
}

impl std::error::Error for RpcError {}

/// The consumed surface of the DHT RPC layer.
#[async_trait]
pub trait SwarmRpc: Clone + Send + Sync + 'static {
    /// This node's id and UDP endpoint.
    fn local(&self) -> NodeAddr;

    /// Iterative lookup toward `target`: fan out to the k closest nodes and
    /// stream their replies. The receiver closes when the iteration
    /// exhausts.
    async fn query(
        &self,
        command: Command,
        target: Target,
        value: Option<Vec<u8>>,
    ) -> mpsc::Receiver<Reply>;

    /// Single-hop request to a known node. `token` carries a round-trip
    /// token from an earlier reply when the request is a signed write.
    async fn request(
        &self,
        to: NodeAddr,
        command: Command,
        target: Target,
        value: Option<Vec<u8>>,
        token: Option<[u8; 32]>,
    ) -> Result<Reply, RpcError>;

    /// Ping a node and return the address it observed us at (our reflexive
    /// address from its vantage point).
    async fn ping_observed(&self, to: NodeAddr) -> Result<PeerAddress, RpcError>;

    /// Ask a node to fire a single datagram at `probe` from a fresh socket.
    /// Receiving it proves we accept unsolicited traffic (an open firewall).
    async fn probe_back(&self, to: NodeAddr, probe: PeerAddress) -> Result<(), RpcError>;

    /// Detach from the network. Requests in flight to this node fail as
    /// unreachable afterwards. Idempotent.
    async fn close(&self);
}
