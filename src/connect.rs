//! # Connector
//!
//! Client side of connection establishment. `connect` hands back a
//! [`Socket`] immediately and drives the phases on a background task:
//!
//! ```text
//! IDLE → LOOKING_UP → RELAYING → PUNCHING → OPEN → CLOSED
//!                    ↘         ↘  error paths  →  CLOSED
//! ```
//!
//! - **Looking up**: iterative findPeer toward `hash(remotePublicKey)`;
//!   the first reply carrying a record names both the server and the relay
//!   that will introduce us.
//! - **Relaying**: one request to the relay with Noise message 1 and our
//!   punch candidates; the reply carries message 2 and the server's.
//! - **Punching**: the strategy table and probe schedule of
//!   [`crate::holepunch`], with the user hook consulted before any probe.
//! - **Open**: the locked socket pair goes to the stream layer.

use std::fmt;
use std::net::IpAddr;

use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::holepunch::{
    FirewallClass, HolepunchHook, PunchError, Puncher, Strategy, PROBE_INTERVAL,
};
use crate::identity::{Identity, Keypair, Target};
use crate::messages::{
    decode_bounded, encode, punch_mode, Command, ConnectPayload, ConnectReply, ErrorCode,
    Holepunch, NodeAddr, PeerAddress, PeerRecord, PunchInfo,
};
use crate::protocols::{RpcError, SwarmRpc};
use crate::transport::{
    finish_handshake, initiate_handshake, socket_pair, Socket, SocketDriver, StreamError,
};

/// Why a connection attempt (or an established stream) ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// The lookup exhausted without any record for the target.
    PeerNotFound,
    /// The Noise exchange failed or authenticated the wrong identity.
    InvalidHandshake,
    /// A hole-punch hook on either side declined the connection.
    HolepunchAborted,
    /// Probing ran out of schedule without locking a flow.
    HolepunchTimeout,
    /// The RPC layer failed underneath the attempt.
    Rpc(RpcError),
    /// The stream died after opening.
    Stream(StreamError),
    /// The owning node or socket shut down.
    Closed,
}

impl ConnectError {
    /// The wire error code equivalent, for errors that have one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ConnectError::PeerNotFound => Some(ErrorCode::PeerNotFound),
            ConnectError::InvalidHandshake => Some(ErrorCode::InvalidSignature),
            ConnectError::HolepunchAborted => Some(ErrorCode::HolepunchAborted),
            ConnectError::HolepunchTimeout => Some(ErrorCode::HolepunchTimeout),
            _ => None,
        }
    }

    fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::PeerNotFound => ConnectError::PeerNotFound,
            ErrorCode::InvalidSignature => ConnectError::InvalidHandshake,
            ErrorCode::HolepunchAborted => ConnectError::HolepunchAborted,
            ErrorCode::HolepunchTimeout => ConnectError::HolepunchTimeout,
            _ => ConnectError::Closed,
        }
    }

    fn from_punch(err: PunchError) -> Self {
        match err {
            PunchError::Vetoed => ConnectError::HolepunchAborted,
            PunchError::Timeout | PunchError::Unreachable | PunchError::Io(_) => {
                ConnectError::HolepunchTimeout
            }
            PunchError::Cancelled => ConnectError::Closed,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::PeerNotFound => write!(f, "no record found for peer"),
            ConnectError::InvalidHandshake => write!(f, "handshake failed"),
            ConnectError::HolepunchAborted => write!(f, "hole punch aborted"),
            ConnectError::HolepunchTimeout => write!(f, "hole punch timed out"),
            ConnectError::Rpc(err) => write!(f, "rpc failure: {}", err),
            ConnectError::Stream(err) => write!(f, "stream failure: {}", err),
            ConnectError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Options for a single `connect` call.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Keypair identifying this side of the stream; the node's default
    /// keypair when unset.
    pub keypair: Option<Keypair>,
    /// Veto hook consulted before probing starts.
    pub holepunch: Option<HolepunchHook>,
    /// Override the node-level fast-open default.
    pub fast_open: Option<bool>,
}

/// Everything a connection attempt needs from its node.
pub(crate) struct ConnectContext<R> {
    pub rpc: R,
    pub keypair: Keypair,
    pub local_class: FirewallClass,
    pub bind_ip: IpAddr,
    pub fast_open: bool,
    pub cancel: watch::Receiver<bool>,
    pub holepunch_hook: Option<HolepunchHook>,
}

/// Start a connection attempt. The returned socket is live immediately and
/// resolves to open or a terminal error.
pub(crate) fn spawn_connect<R: SwarmRpc>(ctx: ConnectContext<R>, remote: Identity) -> Socket {
    let (socket, driver) = socket_pair(remote);
    tokio::spawn(async move {
        if let Err((driver, err)) = run(ctx, remote, driver).await {
            driver.fail(err);
        }
    });
    socket
}

async fn run<R: SwarmRpc>(
    ctx: ConnectContext<R>,
    remote: Identity,
    driver: SocketDriver,
) -> Result<(), (SocketDriver, ConnectError)> {
    let target: Target = crate::crypto::hash(remote.as_bytes());

    // LOOKING_UP: first record wins. The record's relay addresses serve
    // future reconnects; the node that answered introduces us directly.
    let (_record, relay) = match find_peer(&ctx.rpc, target).await {
        Ok(found) => found,
        Err(err) => return Err((driver, err)),
    };
    trace!(server = %remote, relay = %relay.addr, "peer record found");

    // Session socket and Noise message 1.
    let (state, message1) = match initiate_handshake(&ctx.keypair, &remote) {
        Ok(built) => built,
        Err(_) => return Err((driver, ConnectError::InvalidHandshake)),
    };
    let mut puncher =
        match Puncher::bind(ctx.bind_ip, ctx.local_class, ctx.cancel.clone()).await {
            Ok(puncher) => puncher,
            Err(err) => return Err((driver, ConnectError::from_punch(err))),
        };
    let mut session = [0u8; 16];
    let _ = getrandom::getrandom(&mut session);
    let candidates = match PeerAddress::from_socket_addr(puncher.local_addr()) {
        Some(addr) => vec![addr],
        None => Vec::new(),
    };

    // RELAYING: the relay forwards to the server and returns its reply.
    let payload = ConnectPayload {
        session,
        handshake: message1,
        firewall: ctx.local_class.to_wire(),
        addresses: candidates.clone(),
        observed: None,
    };
    let value = match encode(&payload) {
        Ok(value) => value,
        Err(_) => return Err((driver, ConnectError::InvalidHandshake)),
    };
    let reply = match ctx
        .rpc
        .request(relay, Command::Connect, target, Some(value), None)
        .await
    {
        Ok(reply) => reply,
        Err(err) => return Err((driver, ConnectError::Rpc(err))),
    };
    if let Some(code) = reply.error {
        return Err((driver, ConnectError::from_code(code)));
    }
    let Some(reply_value) = reply.value else {
        return Err((driver, ConnectError::PeerNotFound));
    };
    let Ok(connect_reply) = decode_bounded::<ConnectReply>(&reply_value) else {
        return Err((driver, ConnectError::InvalidHandshake));
    };
    let transport = match finish_handshake(state, &connect_reply.handshake) {
        Ok(transport) => transport,
        Err(_) => return Err((driver, ConnectError::InvalidHandshake)),
    };
    let remote_class = FirewallClass::from_wire(connect_reply.firewall)
        .unwrap_or(FirewallClass::Random);
    debug!(server = %remote, %remote_class, "relay negotiation complete");

    // PUNCHING: user veto first, then the offer/answer exchange.
    if let Some(hook) = &ctx.holepunch_hook {
        let remote_addr = connect_reply
            .addresses
            .first()
            .map(|a| a.socket_addr())
            .unwrap_or_else(|| relay.addr);
        if !hook(remote_class, ctx.local_class, remote_addr, puncher.local_addr()) {
            let abort = Holepunch {
                mode: punch_mode::ABORT,
                payload: encode(&PunchInfo {
                    session,
                    round: 0,
                    firewall: ctx.local_class.to_wire(),
                    candidates: Vec::new(),
                    delay_ms: 0,
                    observed: None,
                })
                .unwrap_or_default(),
            };
            if let Ok(bytes) = encode(&abort) {
                let _ = ctx
                    .rpc
                    .request(relay, Command::Holepunch, target, Some(bytes), None)
                    .await;
            }
            return Err((driver, ConnectError::HolepunchAborted));
        }
    }

    let offer = Holepunch {
        mode: punch_mode::OFFER,
        payload: match encode(&PunchInfo {
            session,
            round: 0,
            firewall: ctx.local_class.to_wire(),
            candidates,
            delay_ms: 0,
            observed: None,
        }) {
            Ok(bytes) => bytes,
            Err(_) => return Err((driver, ConnectError::InvalidHandshake)),
        },
    };
    let value = match encode(&offer) {
        Ok(bytes) => bytes,
        Err(_) => return Err((driver, ConnectError::InvalidHandshake)),
    };
    let reply = match ctx
        .rpc
        .request(relay, Command::Holepunch, target, Some(value), None)
        .await
    {
        Ok(reply) => reply,
        Err(err) => return Err((driver, ConnectError::Rpc(err))),
    };
    if let Some(code) = reply.error {
        return Err((driver, ConnectError::from_code(code)));
    }
    let answer = reply
        .value
        .as_deref()
        .and_then(|bytes| decode_bounded::<Holepunch>(bytes).ok());
    let Some(answer) = answer else {
        return Err((driver, ConnectError::HolepunchTimeout));
    };
    if answer.mode == punch_mode::ABORT {
        return Err((driver, ConnectError::HolepunchAborted));
    }
    let Ok(info) = decode_bounded::<PunchInfo>(&answer.payload) else {
        return Err((driver, ConnectError::HolepunchTimeout));
    };
    let remote_class = FirewallClass::from_wire(info.firewall).unwrap_or(remote_class);

    // The open side leads; the other follows half a burst later so its
    // first probe lands on a warm mapping.
    let start_delay = match puncher.negotiate(remote_class) {
        Ok(Strategy::Direct { probe_first: false }) => PROBE_INTERVAL,
        Ok(_) => Duration::ZERO,
        Err(err) => return Err((driver, ConnectError::from_punch(err))),
    };

    let mut remote_candidates = info.candidates.clone();
    if let Some(observed) = info.observed {
        if !remote_candidates.contains(&observed) {
            remote_candidates.insert(0, observed);
        }
    }

    match puncher.punch(&remote_candidates, remote_class, start_delay).await {
        Ok((socket, remote_addr)) => {
            debug!(server = %remote, %remote_addr, "connection open");
            driver.start(socket, remote_addr, transport, ctx.fast_open);
            Ok(())
        }
        Err(err) => Err((driver, ConnectError::from_punch(err))),
    }
}

/// Iterative findPeer. Returns the first record plus the node that served
/// it.
async fn find_peer<R: SwarmRpc>(
    rpc: &R,
    target: Target,
) -> Result<(PeerRecord, NodeAddr), ConnectError> {
    let mut replies = rpc.query(Command::FindPeer, target, None).await;
    while let Some(reply) = replies.recv().await {
        let Some(value) = reply.value else {
            continue;
        };
        if let Ok(record) = decode_bounded::<PeerRecord>(&value) {
            return Ok((record, reply.from));
        }
    }
    Err(ConnectError::PeerNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_both_ways() {
        assert_eq!(
            ConnectError::PeerNotFound.code(),
            Some(ErrorCode::PeerNotFound)
        );
        assert_eq!(
            ConnectError::from_code(ErrorCode::HolepunchAborted),
            ConnectError::HolepunchAborted
        );
        assert_eq!(
            ConnectError::from_code(ErrorCode::HolepunchTimeout).code(),
            Some(ErrorCode::HolepunchTimeout)
        );
        assert_eq!(ConnectError::Rpc(RpcError::Timeout).code(), None);
    }

    #[test]
    fn punch_errors_map_to_wire_semantics() {
        assert_eq!(
            ConnectError::from_punch(PunchError::Vetoed),
            ConnectError::HolepunchAborted
        );
        assert_eq!(
            ConnectError::from_punch(PunchError::Timeout),
            ConnectError::HolepunchTimeout
        );
        assert_eq!(
            ConnectError::from_punch(PunchError::Unreachable),
            ConnectError::HolepunchTimeout
        );
        assert_eq!(
            ConnectError::from_punch(PunchError::Cancelled),
            ConnectError::Closed
        );
    }
}
