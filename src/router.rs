//! # Router Table
//!
//! Maps each announced target this node knows how to reach onto either a
//! local server (an action channel) or a forwarding address (the server that
//! announced to us, making us one of its relays).
//!
//! Entries for local servers are installed when the server starts listening
//! and removed on close; forwarding entries are installed by verified
//! announces and age out with them. Connect and hole-punch requests arriving
//! for a target are resolved here: local entries get the request as a
//! [`RouterAction`] on their channel, forwarding entries name the next hop.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::identity::Target;
use crate::messages::{ConnectPayload, Holepunch, NodeAddr};
use crate::rpc::ReplyBody;

/// A request routed to a local server.
///
/// The tagged variants replace per-entry callback hooks: the dispatcher
/// resolves the target to a channel and the server owns all state the
/// handling needs.
#[derive(Debug)]
pub enum RouterAction {
    /// A client wants to connect; payload carries its Noise message 1.
    Connect {
        from: NodeAddr,
        payload: ConnectPayload,
        reply: oneshot::Sender<ReplyBody>,
    },
    /// A hole-punch control message for an admitted connection.
    Holepunch {
        from: NodeAddr,
        payload: Holepunch,
        reply: oneshot::Sender<ReplyBody>,
    },
}

/// One routable target.
#[derive(Clone)]
pub struct RouterEntry {
    /// Next hop for forwarded requests; `None` for local servers.
    pub relay: Option<NodeAddr>,
    /// Encoded peer record served from lookups and findPeer.
    pub record: Vec<u8>,
    /// Action channel of the owning local server; `None` for forwarding
    /// entries.
    pub actions: Option<mpsc::Sender<RouterAction>>,
}

impl RouterEntry {
    pub fn is_local(&self) -> bool {
        self.actions.is_some()
    }
}

/// The per-node router table.
#[derive(Default)]
pub struct Router {
    entries: HashMap<Target, RouterEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the entry for `target`.
    pub fn install(&mut self, target: Target, entry: RouterEntry) {
        self.entries.insert(target, entry);
    }

    pub fn remove(&mut self, target: &Target) -> Option<RouterEntry> {
        self.entries.remove(target)
    }

    pub fn get(&self, target: &Target) -> Option<&RouterEntry> {
        self.entries.get(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record: &[u8]) -> RouterEntry {
        RouterEntry {
            relay: None,
            record: record.to_vec(),
            actions: None,
        }
    }

    #[test]
    fn install_replaces_and_remove_clears() {
        let mut router = Router::new();
        let target = [1u8; 32];
        router.install(target, entry(b"a"));
        router.install(target, entry(b"b"));
        assert_eq!(router.len(), 1);
        assert_eq!(router.get(&target).unwrap().record, b"b");
        assert!(router.remove(&target).is_some());
        assert!(router.remove(&target).is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn local_entries_are_distinguished_by_their_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let local = RouterEntry {
            relay: None,
            record: Vec::new(),
            actions: Some(tx),
        };
        assert!(local.is_local());
        assert!(!entry(b"x").is_local());
    }
}
