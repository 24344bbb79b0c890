//! # Hole-Puncher
//!
//! The bilateral NAT-traversal state machine. Given two endpoints that each
//! know their own firewall class, their candidate addresses, and a relay
//! that passes small control messages, the puncher establishes a single UDP
//! 5-tuple both sides agree on and hands the socket to the stream layer.
//!
//! ## Firewall classes
//!
//! Classification observes the reflexive address a handful of DHT peers
//! report for us: constant across peers ⇒ `Consistent`, varying ⇒ `Random`,
//! and provably reachable by unsolicited traffic ⇒ `Open`.
//!
//! ## Strategy table
//!
//! | local \ remote | Open | Consistent | Random |
//! |----------------|------|------------|--------|
//! | Open | direct | direct, we probe first | direct, we probe first |
//! | Consistent | direct, they probe first | simultaneous open | port prediction |
//! | Random | direct, they probe first | port prediction | unreachable |
//!
//! Both sides compute the table independently; it is symmetric, so they
//! agree without negotiation beyond exchanging classes.
//!
//! ## Probing
//!
//! At the agreed start each side sends bursts of [`PROBE_MAGIC`] datagrams
//! (N per burst at interval Δ, up to K rounds) at every candidate. The first
//! datagram received whose source matches a candidate (any port on a
//! candidate host when the remote maps ports randomly) locks the 5-tuple;
//! a short confirmation burst follows so the peer locks too. The whole
//! exchange is bounded by `K·N·Δ + RTT_MAX`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, trace};

use crate::messages::{firewall, Command, PeerAddress};
use crate::protocols::SwarmRpc;

/// Payload of every hole-punch probe datagram.
pub const PROBE_MAGIC: &[u8] = b"BWPUNCH1";

/// Probes per burst (N).
pub const PROBE_BURST: usize = 6;

/// Interval between probes in a burst (Δ).
pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Burst rounds before giving up (K).
pub const PROBE_ROUNDS: usize = 4;

/// Worst-case relay round trip budgeted on top of the probe schedule.
pub const RTT_MAX: Duration = Duration::from_millis(800);

/// Ports tried above each candidate when predicting a random mapper.
const PORT_PREDICTION_RANGE: u16 = 8;

/// Confirmation probes sent after locking, so the peer locks too.
const LOCK_CONFIRMATIONS: usize = 3;

/// Peers sampled for reflexive-address classification.
const CLASSIFY_SAMPLES: usize = 4;

/// How long the open-firewall probe test listens for unsolicited traffic.
const OPEN_PROBE_WAIT: Duration = Duration::from_millis(500);

/// Total time budget for one punch attempt: `K·N·Δ + RTT_MAX`.
pub fn punch_timeout() -> Duration {
    PROBE_INTERVAL * (PROBE_BURST * PROBE_ROUNDS) as u32 + RTT_MAX
}

/// User veto consulted on both sides before probing starts:
/// `(remote class, local class, remote address, local address) → allow`.
pub type HolepunchHook =
    Arc<dyn Fn(FirewallClass, FirewallClass, SocketAddr, SocketAddr) -> bool + Send + Sync>;

// ============================================================================
// Firewall classification
// ============================================================================

/// Local NAT behaviour as observed from the outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallClass {
    /// Unsolicited inbound traffic reaches us.
    Open,
    /// Same reflexive address towards every peer.
    Consistent,
    /// Mapping changes per destination; inbound ports are unpredictable.
    Random,
}

impl FirewallClass {
    pub fn to_wire(self) -> u8 {
        match self {
            FirewallClass::Open => firewall::OPEN,
            FirewallClass::Consistent => firewall::CONSISTENT,
            FirewallClass::Random => firewall::RANDOM,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            firewall::OPEN => Some(FirewallClass::Open),
            firewall::CONSISTENT => Some(FirewallClass::Consistent),
            firewall::RANDOM => Some(FirewallClass::Random),
            _ => None,
        }
    }
}

impl fmt::Display for FirewallClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallClass::Open => write!(f, "open"),
            FirewallClass::Consistent => write!(f, "consistent"),
            FirewallClass::Random => write!(f, "random"),
        }
    }
}

/// Pure classification from reflexive samples.
///
/// `unsolicited` reports whether a probe from a never-contacted socket
/// reached us, which upgrades a consistent mapping to an open one.
pub fn classify_samples(samples: &[PeerAddress], unsolicited: bool) -> FirewallClass {
    if unsolicited {
        return FirewallClass::Open;
    }
    match samples.split_first() {
        Some((first, rest)) if rest.iter().all(|s| s == first) => FirewallClass::Consistent,
        Some(_) => FirewallClass::Random,
        // No observations at all: assume the worst mapping.
        None => FirewallClass::Random,
    }
}

/// Classify by pinging DHT peers and comparing the reflexive addresses they
/// report. With `quick` set the probe test is skipped and the classification
/// settles on the consistency of the observations alone.
pub async fn classify<R: SwarmRpc>(
    rpc: &R,
    probe_socket: &UdpSocket,
    quick: bool,
) -> FirewallClass {
    let mut sample_target = [0u8; 32];
    let _ = getrandom::getrandom(&mut sample_target);

    let mut peers = Vec::new();
    let mut replies = rpc.query(Command::Lookup, sample_target, None).await;
    while let Some(reply) = replies.recv().await {
        if !peers.contains(&reply.from) {
            peers.push(reply.from);
        }
        if peers.len() >= CLASSIFY_SAMPLES {
            break;
        }
    }

    let mut samples = Vec::new();
    for peer in &peers {
        if let Ok(observed) = rpc.ping_observed(*peer).await {
            samples.push(observed);
        }
    }

    let consistent = classify_samples(&samples, false);
    if quick || consistent == FirewallClass::Random {
        return consistent;
    }

    // Consistent mapping: check whether unsolicited traffic gets through,
    // which distinguishes open from merely consistent.
    let Some(observed) = samples.first().copied() else {
        return consistent;
    };
    let Some(peer) = peers.first().copied() else {
        return consistent;
    };
    if rpc.probe_back(peer, observed).await.is_err() {
        return consistent;
    }

    let mut buf = [0u8; 64];
    let deadline = Instant::now() + OPEN_PROBE_WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return consistent;
        }
        match timeout(remaining, probe_socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) if buf[..len] == *PROBE_MAGIC => {
                return FirewallClass::Open;
            }
            Ok(_) => continue,
            Err(_) => return consistent,
        }
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// How two firewall classes traverse each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// At least one side is open; `probe_first` says whether that side is
    /// us. The reachable side leads so the other's first probe finds a
    /// mapping already warm.
    Direct { probe_first: bool },
    /// Both consistent: probe simultaneously at the agreed start.
    SimultaneousOpen,
    /// One side maps ports randomly: the consistent side sprays a bounded
    /// port range predicted from the observed candidate.
    PortPrediction,
    /// Random against random has no predictable rendezvous.
    Unreachable,
}

/// The symmetric strategy table.
pub fn strategy(local: FirewallClass, remote: FirewallClass) -> Strategy {
    use FirewallClass::*;
    match (local, remote) {
        (Open, Open) => Strategy::Direct { probe_first: true },
        (Open, _) => Strategy::Direct { probe_first: true },
        (_, Open) => Strategy::Direct { probe_first: false },
        (Consistent, Consistent) => Strategy::SimultaneousOpen,
        (Consistent, Random) | (Random, Consistent) => Strategy::PortPrediction,
        (Random, Random) => Strategy::Unreachable,
    }
}

// ============================================================================
// Punch state machine
// ============================================================================

/// Lifecycle of one punch attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PunchState {
    New,
    Classifying,
    Negotiating,
    Probing,
    Locked,
    Closed,
}

/// Why a punch attempt ended without a locked flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PunchError {
    /// A user hook declined before probing started.
    Vetoed,
    /// No candidate answered within the probe schedule.
    Timeout,
    /// The strategy table says these classes cannot meet.
    Unreachable,
    /// The owning server or connector shut down mid-attempt.
    Cancelled,
    /// Socket I/O failed.
    Io(String),
}

impl fmt::Display for PunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PunchError::Vetoed => write!(f, "hole punch vetoed"),
            PunchError::Timeout => write!(f, "hole punch timed out"),
            PunchError::Unreachable => write!(f, "firewall classes cannot traverse"),
            PunchError::Cancelled => write!(f, "hole punch cancelled"),
            PunchError::Io(err) => write!(f, "hole punch i/o error: {}", err),
        }
    }
}

impl std::error::Error for PunchError {}

/// One side of a punch attempt. Owns the session socket until a flow locks.
pub struct Puncher {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    local_class: FirewallClass,
    state: PunchState,
    cancel: watch::Receiver<bool>,
}

impl Puncher {
    /// Bind a fresh session socket on `ip`. Every connection punches from
    /// its own socket so concurrent sessions never contend for datagrams.
    pub async fn bind(
        ip: IpAddr,
        local_class: FirewallClass,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, PunchError> {
        let socket = UdpSocket::bind((ip, 0))
            .await
            .map_err(|err| PunchError::Io(err.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|err| PunchError::Io(err.to_string()))?;
        Ok(Self {
            socket: Some(socket),
            local_addr,
            local_class,
            state: PunchState::New,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> PunchState {
        self.state
    }

    /// Settle on a strategy against the remote class. Fails fast when the
    /// table says unreachable.
    pub fn negotiate(&mut self, remote: FirewallClass) -> Result<Strategy, PunchError> {
        self.state = PunchState::Negotiating;
        let strategy = strategy(self.local_class, remote);
        if strategy == Strategy::Unreachable {
            self.state = PunchState::Closed;
            return Err(PunchError::Unreachable);
        }
        Ok(strategy)
    }

    /// A user hook declined; the attempt is dead before any probe left.
    pub fn veto(&mut self) -> PunchError {
        self.state = PunchState::Closed;
        PunchError::Vetoed
    }

    /// Drive the probe schedule until a candidate answers. On success the
    /// locked socket and remote address come back ready for the stream
    /// layer.
    pub async fn punch(
        &mut self,
        candidates: &[PeerAddress],
        remote: FirewallClass,
        start_delay: Duration,
    ) -> Result<(UdpSocket, SocketAddr), PunchError> {
        let strategy = self.negotiate(remote)?;
        let socket = self.socket.take().ok_or(PunchError::Cancelled)?;
        self.state = PunchState::Probing;

        let targets = probe_targets(candidates, strategy, remote);
        if targets.is_empty() {
            self.state = PunchState::Closed;
            return Err(PunchError::Timeout);
        }
        trace!(
            local = %self.local_addr,
            targets = targets.len(),
            ?strategy,
            "probing"
        );

        if !start_delay.is_zero() {
            sleep(start_delay).await;
        }

        let mut cancel = self.cancel.clone();
        let result = tokio::select! {
            outcome = probe_loop(&socket, &targets, remote) => outcome,
            _ = cancel.changed() => Err(PunchError::Cancelled),
            _ = sleep(punch_timeout()) => Err(PunchError::Timeout),
        };

        match result {
            Ok(remote_addr) => {
                self.state = PunchState::Locked;
                debug!(local = %self.local_addr, remote = %remote_addr, "flow locked");
                Ok((socket, remote_addr))
            }
            Err(err) => {
                self.state = PunchState::Closed;
                Err(err)
            }
        }
    }
}

/// Expand candidates into concrete probe targets. Port prediction sprays a
/// bounded range above each observed port; other strategies probe the
/// candidates as given.
fn probe_targets(
    candidates: &[PeerAddress],
    strategy: Strategy,
    remote: FirewallClass,
) -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    for candidate in candidates {
        targets.push(candidate.socket_addr());
        if strategy == Strategy::PortPrediction && remote == FirewallClass::Random {
            for offset in 1..=PORT_PREDICTION_RANGE {
                let port = candidate.port.wrapping_add(offset);
                if port != 0 {
                    targets.push(SocketAddr::new(IpAddr::V4(candidate.host), port));
                }
            }
        }
    }
    targets.dedup();
    targets
}

/// Send probe bursts and listen until a candidate answers.
async fn probe_loop(
    socket: &UdpSocket,
    targets: &[SocketAddr],
    remote: FirewallClass,
) -> Result<SocketAddr, PunchError> {
    let (hit_tx, mut hit_rx) = mpsc::channel::<SocketAddr>(1);

    let send = async {
        for _round in 0..PROBE_ROUNDS {
            for _ in 0..PROBE_BURST {
                for target in targets {
                    let _ = socket.send_to(PROBE_MAGIC, target).await;
                }
                sleep(PROBE_INTERVAL).await;
            }
        }
        // Bursts exhausted; keep the future pending so the receive side
        // (or the outer timeout) decides the outcome.
        std::future::pending::<()>().await;
    };

    let recv = async {
        let mut buf = [0u8; 64];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            if buf[..len] != *PROBE_MAGIC {
                continue;
            }
            let matches = targets.iter().any(|t| *t == from)
                || (remote == FirewallClass::Random
                    && targets.iter().any(|t| t.ip() == from.ip()));
            if matches {
                let _ = hit_tx.send(from).await;
                return;
            }
        }
    };

    tokio::select! {
        _ = send => unreachable!("probe sender never resolves"),
        _ = recv => {}
    }

    let from = hit_rx.recv().await.ok_or(PunchError::Timeout)?;
    // Confirmation burst: the peer locks on the first of these even if all
    // our earlier probes were eaten by its NAT warming up.
    for _ in 0..LOCK_CONFIRMATIONS {
        let _ = socket.send_to(PROBE_MAGIC, from).await;
        sleep(Duration::from_millis(5)).await;
    }
    Ok(from)
}
