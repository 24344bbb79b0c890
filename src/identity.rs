//! # Identities and Keypairs
//!
//! Two kinds of 32-byte names exist in the overlay:
//!
//! - [`Identity`]: an Ed25519 public key. Servers and nodes are each named by
//!   one; a process may hold many of either.
//! - [`Target`]: the BLAKE2b-256 hash of a public key (or of an immutable
//!   value). Targets index record slots in the DHT keyspace.
//!
//! An identity and its target are distinct objects on purpose: records are
//! looked up by target, but every signature check happens against the
//! identity the record claims.
//!
//! ## Ordering
//!
//! Lookup fan-out visits nodes in XOR-distance order over the 256-bit
//! keyspace. [`distance_cmp`] provides that ordering without materializing
//! the distances.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// 32-byte DHT record slot index (BLAKE2b-256 output).
pub type Target = [u8; 32];

/// A 32-byte Ed25519 public key naming a node or a server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes decode to a valid Ed25519 point. Records claiming
    /// an identity that is not a curve point can never verify and are
    /// rejected before any signature work.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// Verify an Ed25519 signature over `message` under this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }

    /// The DHT record slot this identity announces under.
    pub fn target(&self) -> Target {
        crate::crypto::hash(&self.0)
    }

    /// XOR distance to another identity or target.
    pub fn xor_distance(&self, other: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other[i];
        }
        out
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Compare two 32-byte ids by XOR distance to `reference`.
///
/// Returns `Less` when `a` is closer. Byte-wise comparison of the XOR
/// distances is equivalent to comparing the 256-bit integers.
pub fn distance_cmp(reference: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        let da = reference[i] ^ a[i];
        let db = reference[i] ^ b[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    std::cmp::Ordering::Equal
}

/// An Ed25519 signing keypair.
///
/// Holds the secret key; the public half is the peer's [`Identity`].
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Derive a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity(self.signing.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign a message, returning the 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The X25519 secret matching [`Keypair::x25519_public`], for the Noise
    /// handshake. This is the standard birational conversion, so any peer can
    /// derive our Noise static public key from the announced identity alone.
    pub fn x25519_secret(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }

    pub fn x25519_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_montgomery().to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        write!(f, "Keypair({})", self.identity())
    }
}

/// Convert a foreign identity to its X25519 (Montgomery) form.
///
/// Returns `None` when the bytes are not a valid Ed25519 point.
pub fn x25519_from_identity(identity: &Identity) -> Option<[u8; 32]> {
    let key = VerifyingKey::from_bytes(identity.as_bytes()).ok()?;
    Some(key.to_montgomery().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_bytes() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        assert_eq!(
            Identity::from_bytes(*identity.as_bytes()),
            identity,
            "identity must survive a bytes round trip"
        );
    }

    #[test]
    fn seeded_keypairs_are_deterministic() {
        let a = Keypair::from_seed([7u8; 32]);
        let b = Keypair::from_seed([7u8; 32]);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.secret_key_bytes(), [7u8; 32]);
        assert_ne!(a.identity(), Keypair::from_seed([8u8; 32]).identity());
    }

    #[test]
    fn secret_key_bytes_rebuild_the_keypair() {
        let original = Keypair::generate();
        let rebuilt = Keypair::from_seed(original.secret_key_bytes());
        assert_eq!(rebuilt.identity(), original.identity());
    }

    #[test]
    fn signatures_verify_under_the_signing_identity_only() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let sig = keypair.sign(b"announce");
        assert!(keypair.identity().verify(b"announce", &sig));
        assert!(!keypair.identity().verify(b"announce!", &sig));
        assert!(!other.identity().verify(b"announce", &sig));
    }

    #[test]
    fn distance_cmp_orders_by_xor_metric() {
        let reference = [0u8; 32];
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 0x80;
        assert_eq!(distance_cmp(&reference, &near, &far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&reference, &far, &near), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&reference, &near, &near), std::cmp::Ordering::Equal);
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();
        assert_eq!(a.xor_distance(b.as_bytes()), b.xor_distance(a.as_bytes()));
    }

    #[test]
    fn x25519_conversion_agrees_between_halves() {
        // The public conversion of the verifying key must match the point
        // derived from the converted secret, otherwise Noise_IK cannot
        // address a server by its announced identity.
        let keypair = Keypair::generate();
        let from_public = x25519_from_identity(&keypair.identity()).expect("valid point");
        assert_eq!(from_public, keypair.x25519_public());
    }

    #[test]
    fn invalid_points_are_rejected() {
        let identity = Identity::from_bytes([0xff; 32]);
        assert!(!identity.verify(b"x", &[0u8; 64]));
    }
}
