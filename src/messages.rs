//! # Wire Protocol Messages
//!
//! Serializable payloads for every overlay RPC. Encoding is bincode with
//! varint integers; every decode goes through [`decode_bounded`] so a hostile
//! payload cannot ask for unbounded allocation.
//!
//! | Command | Request value | Reply value |
//! |---------|---------------|-------------|
//! | Lookup | — | `Vec<PeerRecord>` |
//! | FindPeer | — | `PeerRecord` |
//! | Announce / Unannounce | `Announce` | empty |
//! | MutableGet | `MutableGet` | `MutableRecord` |
//! | MutablePut | `MutablePut` | empty or error code |
//! | ImmutableGet | — | raw value |
//! | ImmutablePut | raw value | empty |
//! | Connect | `ConnectPayload` | `ConnectReply` |
//! | Holepunch | `Holepunch` | `Holepunch` |
//!
//! A reply with no value encodes as a null payload.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::Target;

/// Maximum size of a stored mutable/immutable value.
pub const MAX_STORED_VALUE: usize = 1000;

/// Maximum relay addresses kept per peer record.
pub const MAX_RELAY_ADDRESSES: usize = 3;

/// Maximum buffer accepted by [`decode_bounded`]. Generous headroom over the
/// largest legal payload (a full lookup reply of 20 records).
pub const MAX_DESERIALIZE_SIZE: u64 = 16 * 1024;

/// Returns bincode options with varint integers and the size limit enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DESERIALIZE_SIZE)
}

/// Encode a message with the canonical options.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Decode with size bounds enforced. Use this instead of raw
/// `bincode::deserialize` everywhere a peer controls the bytes.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Commands and error codes
// ============================================================================

/// Overlay RPC commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Lookup,
    FindPeer,
    Announce,
    Unannounce,
    MutableGet,
    MutablePut,
    ImmutableGet,
    ImmutablePut,
    Connect,
    Holepunch,
}

/// Typed errors returned on the wire.
///
/// Everything else that goes wrong in a handler is a silent drop; these are
/// the only codes a requester ever sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    SeqReused = 0,
    SeqTooLow = 1,
    InvalidSignature = 2,
    PeerNotFound = 3,
    HolepunchAborted = 4,
    HolepunchTimeout = 5,
}

impl ErrorCode {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::SeqReused),
            1 => Some(Self::SeqTooLow),
            2 => Some(Self::InvalidSignature),
            3 => Some(Self::PeerNotFound),
            4 => Some(Self::HolepunchAborted),
            5 => Some(Self::HolepunchTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SeqReused => "SEQ_REUSED",
            Self::SeqTooLow => "SEQ_TOO_LOW",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::PeerNotFound => "PEER_NOT_FOUND",
            Self::HolepunchAborted => "HOLEPUNCH_ABORTED",
            Self::HolepunchTimeout => "HOLEPUNCH_TIMEOUT",
        };
        write!(f, "{}", name)
    }
}

impl std::error::Error for ErrorCode {}

// ============================================================================
// Addresses
// ============================================================================

/// A compact IPv4 endpoint as carried in peer records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }

    /// IPv4 endpoints only; the overlay wire format does not carry IPv6.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self {
                host: *v4.ip(),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Address of a DHT node: its 32-byte node id plus its UDP endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub id: [u8; 32],
    pub addr: SocketAddr,
}

// ============================================================================
// Records
// ============================================================================

/// Announce payload body: how to reach a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub public_key: [u8; 32],
    pub relay_addresses: Vec<PeerAddress>,
    pub relay_auth: Option<Vec<u8>>,
}

impl PeerRecord {
    /// Copy with `relay_addresses` truncated to the storage bound.
    pub fn truncated(&self) -> Self {
        let mut record = self.clone();
        record.relay_addresses.truncate(MAX_RELAY_ADDRESSES);
        record
    }
}

/// A signed announce or unannounce.
///
/// A message carrying only `refresh` is a renewal: the field holds the
/// revealed chain token rather than a new slot head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub peer: Option<PeerRecord>,
    pub refresh: Option<[u8; 32]>,
    pub signature: Option<Vec<u8>>,
}

impl Announce {
    pub fn is_refresh_only(&self) -> bool {
        self.peer.is_none() && self.signature.is_none() && self.refresh.is_some()
    }
}

/// Mutable-put request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutablePut {
    pub public_key: [u8; 32],
    pub seq: u64,
    pub value: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Mutable-get request: the highest sequence the requester already holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableGet {
    pub seq: u64,
}

/// Stored mutable record, returned to getters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableRecord {
    pub seq: u64,
    pub value: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The `{ seq, value }` body a mutable signature commits to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutableSignable {
    pub seq: u64,
    pub value: Vec<u8>,
}

// ============================================================================
// Connection establishment
// ============================================================================

/// Firewall classes on the wire.
pub mod firewall {
    pub const OPEN: u8 = 0;
    pub const CONSISTENT: u8 = 1;
    pub const RANDOM: u8 = 2;
}

/// Connect request: the client's Noise handshake message 1 plus its UDP
/// candidates. `observed` is stamped by the relay with the address it saw the
/// request arrive from; a client never fills it in itself. `session`
/// distinguishes concurrent connections from the same node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub session: [u8; 16],
    pub handshake: Vec<u8>,
    pub firewall: u8,
    pub addresses: Vec<PeerAddress>,
    pub observed: Option<PeerAddress>,
}

/// Connect reply: Noise message 2 plus the server's candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub handshake: Vec<u8>,
    pub firewall: u8,
    pub addresses: Vec<PeerAddress>,
}

/// Hole-punch control message: a mode byte and an opaque payload
/// (an encoded [`PunchInfo`] for offers and answers, empty for aborts).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holepunch {
    pub mode: u8,
    pub payload: Vec<u8>,
}

/// Hole-punch message modes.
pub mod punch_mode {
    pub const OFFER: u8 = 0;
    pub const ANSWER: u8 = 1;
    pub const ABORT: u8 = 2;
}

/// Probing schedule and candidates exchanged through the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchInfo {
    pub session: [u8; 16],
    pub round: u8,
    pub firewall: u8,
    pub candidates: Vec<PeerAddress>,
    /// Milliseconds the sender will wait before its first probe burst.
    pub delay_ms: u32,
    /// Stamped by the relay, like [`ConnectPayload::observed`].
    pub observed: Option<PeerAddress>,
}

/// Compute the announce target for a public key. Convenience re-export used
/// throughout record handling.
pub fn target_for_key(public_key: &[u8; 32]) -> Target {
    crate::crypto::hash(public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress {
            host: Ipv4Addr::new(127, 0, 0, 1),
            port,
        }
    }

    #[test]
    fn peer_record_round_trips() {
        let record = PeerRecord {
            public_key: [3u8; 32],
            relay_addresses: vec![addr(1000), addr(1001)],
            relay_auth: Some(vec![9, 9, 9]),
        };
        let bytes = encode(&record).unwrap();
        let back: PeerRecord = decode_bounded(&bytes).unwrap();
        assert_eq!(back, record);
        assert_eq!(encode(&back).unwrap(), bytes);
    }

    #[test]
    fn announce_round_trips_with_and_without_refresh() {
        for refresh in [None, Some([7u8; 32])] {
            let announce = Announce {
                peer: Some(PeerRecord {
                    public_key: [1u8; 32],
                    relay_addresses: vec![addr(2000)],
                    relay_auth: None,
                }),
                refresh,
                signature: Some(vec![0u8; 64]),
            };
            let bytes = encode(&announce).unwrap();
            assert_eq!(decode_bounded::<Announce>(&bytes).unwrap(), announce);
        }
    }

    #[test]
    fn refresh_only_announce_is_detected() {
        let renewal = Announce {
            peer: None,
            refresh: Some([5u8; 32]),
            signature: None,
        };
        assert!(renewal.is_refresh_only());

        let full = Announce {
            peer: None,
            refresh: Some([5u8; 32]),
            signature: Some(vec![0u8; 64]),
        };
        assert!(!full.is_refresh_only());
    }

    #[test]
    fn mutable_messages_round_trip() {
        let put = MutablePut {
            public_key: [2u8; 32],
            seq: 300,
            value: b"value".to_vec(),
            signature: vec![1u8; 64],
        };
        let bytes = encode(&put).unwrap();
        assert_eq!(decode_bounded::<MutablePut>(&bytes).unwrap(), put);

        let record = MutableRecord {
            seq: 300,
            value: b"value".to_vec(),
            signature: vec![1u8; 64],
        };
        let bytes = encode(&record).unwrap();
        assert_eq!(decode_bounded::<MutableRecord>(&bytes).unwrap(), record);
    }

    #[test]
    fn connect_and_punch_messages_round_trip() {
        let payload = ConnectPayload {
            session: [8u8; 16],
            handshake: vec![1, 2, 3],
            firewall: firewall::CONSISTENT,
            addresses: vec![addr(4000)],
            observed: Some(addr(4001)),
        };
        let bytes = encode(&payload).unwrap();
        assert_eq!(decode_bounded::<ConnectPayload>(&bytes).unwrap(), payload);

        let info = PunchInfo {
            session: [8u8; 16],
            round: 1,
            firewall: firewall::OPEN,
            candidates: vec![addr(5000), addr(5001)],
            delay_ms: 150,
            observed: None,
        };
        let punch = Holepunch {
            mode: punch_mode::OFFER,
            payload: encode(&info).unwrap(),
        };
        let bytes = encode(&punch).unwrap();
        let back: Holepunch = decode_bounded(&bytes).unwrap();
        assert_eq!(back, punch);
        assert_eq!(decode_bounded::<PunchInfo>(&back.payload).unwrap(), info);
    }

    #[test]
    fn decode_rejects_oversized_buffers() {
        let huge = vec![0u8; (MAX_DESERIALIZE_SIZE + 1) as usize];
        assert!(decode_bounded::<Vec<u8>>(&huge).is_err());
    }

    #[test]
    fn error_codes_round_trip_through_wire_bytes() {
        for code in [
            ErrorCode::SeqReused,
            ErrorCode::SeqTooLow,
            ErrorCode::InvalidSignature,
            ErrorCode::PeerNotFound,
            ErrorCode::HolepunchAborted,
            ErrorCode::HolepunchTimeout,
        ] {
            assert_eq!(ErrorCode::from_wire(code as u8), Some(code));
        }
        assert_eq!(ErrorCode::from_wire(200), None);
    }

    #[test]
    fn relay_addresses_truncate_to_storage_bound() {
        let record = PeerRecord {
            public_key: [0u8; 32],
            relay_addresses: (0..6).map(addr).collect(),
            relay_auth: None,
        };
        assert_eq!(record.truncated().relay_addresses.len(), MAX_RELAY_ADDRESSES);
        // The original is untouched; only storage truncates.
        assert_eq!(record.relay_addresses.len(), 6);
    }
}
