//! # Cryptographic Constructions
//!
//! All hashing in the overlay is BLAKE2b-256. This module provides:
//!
//! - **Targets**: `hash(publicKey)` for announce/mutable slots,
//!   `hash(value)` for immutable slots
//! - **Namespaced signables**: the digests that announce, unannounce and
//!   mutable-put signatures commit to
//! - **Refresh chains**: hash chains backing cheap announce renewal
//!
//! ## Signable layout
//!
//! | Signature | Commits to |
//! |-----------|-----------|
//! | announce | `BLAKE2b(ns ‖ target ‖ nodeId ‖ token ‖ peer ‖ refresh?)` |
//! | unannounce | same, under the unannounce namespace |
//! | mutable put | `BLAKE2b(ns ‖ encode({seq, value}))` |
//!
//! `nodeId` is the id of the storing peer and `token` the round-trip token it
//! issued, so a captured announce cannot be replayed against a different node
//! or without a fresh exchange. Namespaces keep a signature from one context
//! from ever verifying in another.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::identity::{Identity, Keypair, Target};

type Blake2b256 = Blake2b<U32>;

// ============================================================================
// Namespaces
// ============================================================================

/// Namespace for announce signatures.
pub const NS_ANNOUNCE: &[u8] = b"burrow-announce-v1:";

/// Namespace for unannounce signatures.
pub const NS_UNANNOUNCE: &[u8] = b"burrow-unannounce-v1:";

/// Namespace for mutable-put signatures.
pub const NS_MUTABLE_PUT: &[u8] = b"burrow-mutable-v1:";

/// Namespace for round-trip tokens minted by the RPC layer.
pub const NS_TOKEN: &[u8] = b"burrow-token-v1:";

// ============================================================================
// Hashing
// ============================================================================

/// BLAKE2b-256 of a single buffer. Used for targets: `hash(publicKey)` and
/// `hash(value)`.
pub fn hash(data: &[u8]) -> Target {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-256 over a namespace followed by message parts.
pub fn namespaced_hash(namespace: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(namespace);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// The digest an announce or unannounce signature commits to.
///
/// `peer` is the canonical encoding of the peer record; `refresh` is present
/// only when the announce binds a refresh slot.
pub fn announce_signable(
    namespace: &[u8],
    target: &Target,
    node_id: &[u8; 32],
    token: &[u8; 32],
    peer: &[u8],
    refresh: Option<&[u8; 32]>,
) -> [u8; 32] {
    match refresh {
        Some(r) => namespaced_hash(namespace, &[target, node_id, token, peer, r]),
        None => namespaced_hash(namespace, &[target, node_id, token, peer]),
    }
}

/// The digest a mutable-put signature commits to. `encoded` is the canonical
/// encoding of `{ seq, value }`.
pub fn mutable_signable(encoded: &[u8]) -> [u8; 32] {
    namespaced_hash(NS_MUTABLE_PUT, &[encoded])
}

// ============================================================================
// Signing helpers
// ============================================================================

/// Sign an announce/unannounce signable.
pub fn sign_announce(
    keypair: &Keypair,
    namespace: &[u8],
    target: &Target,
    node_id: &[u8; 32],
    token: &[u8; 32],
    peer: &[u8],
    refresh: Option<&[u8; 32]>,
) -> [u8; 64] {
    let signable = announce_signable(namespace, target, node_id, token, peer, refresh);
    keypair.sign(&signable)
}

/// Verify an announce/unannounce signature against the exact signable it
/// should commit to.
pub fn verify_announce(
    identity: &Identity,
    namespace: &[u8],
    target: &Target,
    node_id: &[u8; 32],
    token: &[u8; 32],
    peer: &[u8],
    refresh: Option<&[u8; 32]>,
    signature: &[u8],
) -> bool {
    let signable = announce_signable(namespace, target, node_id, token, peer, refresh);
    identity.verify(&signable, signature)
}

// ============================================================================
// Refresh chains
// ============================================================================

/// A hash chain backing cheap announce renewal.
///
/// The announce carries the chain head; every renewal reveals the next
/// preimage down the chain. The storing node checks `hash(token)` against the
/// slot it holds and re-binds the slot to the revealed token, which makes
/// each link single-use. When the chain runs out the server re-announces from
/// scratch.
pub struct RefreshChain {
    // links[0] is the announced head; links[i] = hash(links[i + 1]).
    links: Vec<[u8; 32]>,
    next: usize,
}

impl RefreshChain {
    /// Build a chain supporting `renewals` cheap refreshes.
    pub fn generate(renewals: usize) -> Self {
        let mut links = vec![[0u8; 32]; renewals + 1];
        let mut tail = [0u8; 32];
        // Best-effort randomness failure here would repeat a chain; the
        // tokens only gate cheap renewal, never record validity.
        let _ = getrandom::getrandom(&mut tail);
        links[renewals] = tail;
        for i in (0..renewals).rev() {
            links[i] = hash(&links[i + 1]);
        }
        Self { links, next: 1 }
    }

    /// The head link, carried in the initial announce.
    pub fn head(&self) -> [u8; 32] {
        self.links[0]
    }

    /// Reveal the next preimage, or `None` when the chain is exhausted.
    pub fn advance(&mut self) -> Option<[u8; 32]> {
        let link = self.links.get(self.next).copied()?;
        self.next += 1;
        Some(link)
    }

    pub fn remaining(&self) -> usize {
        self.links.len() - self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_input_sensitive() {
        assert_eq!(hash(b"a"), hash(b"a"));
        assert_ne!(hash(b"a"), hash(b"b"));
    }

    #[test]
    fn namespaces_separate_signables() {
        let target = hash(b"t");
        let node_id = [1u8; 32];
        let token = [2u8; 32];
        let a = announce_signable(NS_ANNOUNCE, &target, &node_id, &token, b"peer", None);
        let u = announce_signable(NS_UNANNOUNCE, &target, &node_id, &token, b"peer", None);
        assert_ne!(a, u, "announce and unannounce must never share a signable");
    }

    #[test]
    fn signable_binds_every_field() {
        let target = hash(b"t");
        let base = announce_signable(NS_ANNOUNCE, &target, &[1; 32], &[2; 32], b"p", None);
        assert_ne!(
            base,
            announce_signable(NS_ANNOUNCE, &target, &[9; 32], &[2; 32], b"p", None),
            "node id must be bound"
        );
        assert_ne!(
            base,
            announce_signable(NS_ANNOUNCE, &target, &[1; 32], &[9; 32], b"p", None),
            "token must be bound"
        );
        assert_ne!(
            base,
            announce_signable(NS_ANNOUNCE, &target, &[1; 32], &[2; 32], b"p", Some(&[3; 32])),
            "refresh slot must be bound when present"
        );
    }

    #[test]
    fn announce_signatures_verify() {
        let keypair = Keypair::generate();
        let target = hash(keypair.identity().as_bytes());
        let sig = sign_announce(&keypair, NS_ANNOUNCE, &target, &[1; 32], &[2; 32], b"p", None);
        assert!(verify_announce(
            &keypair.identity(),
            NS_ANNOUNCE,
            &target,
            &[1; 32],
            &[2; 32],
            b"p",
            None,
            &sig
        ));
        assert!(!verify_announce(
            &keypair.identity(),
            NS_UNANNOUNCE,
            &target,
            &[1; 32],
            &[2; 32],
            b"p",
            None,
            &sig
        ));
    }

    #[test]
    fn refresh_chain_links_hash_to_their_predecessor() {
        let mut chain = RefreshChain::generate(4);
        let mut slot = chain.head();
        let mut seen = 0;
        while let Some(token) = chain.advance() {
            assert_eq!(hash(&token), slot, "each link must open the prior slot");
            slot = token;
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(chain.remaining(), 0);
    }
}
