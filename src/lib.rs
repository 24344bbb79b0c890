//! # Burrow - Hole-Punching DHT Overlay
//!
//! Burrow provides authenticated, end-to-end encrypted stream connections
//! between Ed25519 public-key identities across NAT boundaries:
//!
//! - **Identity**: a server is named by its 32-byte public key; its DHT
//!   record slot is the BLAKE2b-256 of that key
//! - **Discovery**: announce/lookup records on a Kademlia-style DHT, with
//!   signed announces, refresh chains, and mutable/immutable value storage
//! - **Introduction**: a relay node close to the server's target forwards
//!   connect and hole-punch control messages between the two sides
//! - **Traversal**: a bilateral UDP hole-punch locks a 5-tuple both sides
//!   agree on, driven by a firewall-class strategy table
//! - **Streams**: Noise_IK authenticated, AEAD-sealed reliable byte streams
//!   over the punched flow
//!
//! ## Architecture
//!
//! Each component follows the actor pattern: a public handle communicates
//! over channels with a task that owns all mutable state. A node's record
//! store and router mutate only on its actor; servers and connections run
//! as their own tasks and cancel through watch channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `Dht` facade combining every component |
//! | `identity` | Keypairs, identities, targets, XOR ordering |
//! | `crypto` | BLAKE2b namespaced signables, refresh chains |
//! | `store` | Announce / mutable / immutable record caches |
//! | `router` | Target → local server or forwarding relay |
//! | `server` | Announce lifecycle and connection admission |
//! | `connect` | Client connection state machine |
//! | `holepunch` | Firewall classes, strategy table, probe schedule |
//! | `transport` | Noise handshake and the reliable encrypted stream |
//! | `protocols` | The consumed DHT RPC trait seam |
//! | `rpc` | In-process mesh RPC implementation |
//! | `messages` | Wire payload schemas |

mod connect;
mod crypto;
mod holepunch;
mod identity;
mod messages;
mod node;
mod protocols;
mod router;
mod rpc;
mod server;
mod store;
mod transport;

pub use connect::{ConnectError, ConnectOptions};
pub use holepunch::{FirewallClass, HolepunchHook, PunchError, PunchState, Strategy};
pub use identity::{Identity, Keypair, Target};
pub use messages::{Command, ErrorCode, NodeAddr, PeerAddress, PeerRecord};
pub use node::{keypair, Dht, DhtOptions};
pub use protocols::{Reply, RpcError, SwarmRpc};
pub use rpc::{InboundRequest, MeshNet, MeshRpc, ReplyBody};
pub use server::{FirewallHook, Server, ServerOptions};
pub use transport::{Socket, SocketState, StreamError};
