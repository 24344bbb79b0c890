//! # Encrypted Stream Transport
//!
//! The byte stream that rides a punched UDP flow. Two layers live here:
//!
//! - **Noise_IK**: the handshake the connect round-trip carries. Message 1
//!   rides the connect request, message 2 the reply, so by the time a
//!   5-tuple is locked both sides already hold transport keys.
//! - **Framing**: a small reliable protocol over the socket pair with
//!   sequence-numbered frames, cumulative acks, retransmission and in-order
//!   delivery. Every data-bearing frame is AEAD-sealed with an explicit
//!   nonce derived from its sequence number, so datagram loss and reordering
//!   never desynchronise the cipher.
//!
//! ## Frames
//!
//! | Frame | Carries | Nonce |
//! |-------|---------|-------|
//! | OPEN | optional first payload | `2·seq` |
//! | DATA | stream bytes | `2·seq` |
//! | END | graceful fin | `2·seq` |
//! | ACK | next expected seq | `2·ack + 1` |
//! | CLOSE | abrupt teardown, header only | — |
//!
//! A [`Socket`] is the public handle: a channel-like read/write surface with
//! an observable state machine (connecting → open → closed) instead of an
//! event emitter.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use snow::{Builder, HandshakeState, StatelessTransportState};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::connect::ConnectError;
use crate::identity::{x25519_from_identity, Identity, Keypair};
use crate::messages::{decode_bounded, encode};
use serde::{Deserialize, Serialize};

/// Noise pattern: initiator knows the responder's static key, which is the
/// announced server identity in X25519 form.
const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Frame header: magic(4) + type(1) + seq(4).
const HEADER_SIZE: usize = 9;

/// Magic prefix of every stream frame.
const STREAM_MAGIC: [u8; 4] = *b"BWST";

/// Payload bytes per frame; keeps frames inside a common UDP MTU.
const MAX_FRAME_PAYLOAD: usize = 1200;

/// Frames in flight before writes queue in the backlog.
const MAX_WINDOW: usize = 64;

/// Retransmission probe interval.
const RETRANSMIT_TICK: Duration = Duration::from_millis(200);

/// Retransmissions per frame before the stream gives up.
const MAX_RETRANSMITS: u32 = 25;

mod frame_type {
    pub const OPEN: u8 = 1;
    pub const DATA: u8 = 2;
    pub const ACK: u8 = 3;
    pub const END: u8 = 4;
    pub const CLOSE: u8 = 5;
}

// ============================================================================
// Errors
// ============================================================================

/// Stream-level failures surfaced on [`Socket`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// The stream is closed (or closing) and accepts no more writes.
    Closed,
    /// The peer stopped acknowledging; the flow is considered dead.
    RetriesExhausted,
    /// Socket I/O failed.
    Io(String),
    /// AEAD seal/open failed; the flow is not trustworthy.
    Crypto,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closed => write!(f, "stream closed"),
            StreamError::RetriesExhausted => write!(f, "peer stopped acknowledging"),
            StreamError::Io(err) => write!(f, "stream i/o error: {}", err),
            StreamError::Crypto => write!(f, "stream crypto failure"),
        }
    }
}

impl std::error::Error for StreamError {}

// ============================================================================
// Noise handshake
// ============================================================================

/// Identity assertions carried in the clear-after-decrypt Noise payloads.
/// The responder checks it is the intended server; both sides learn the
/// peer's Ed25519 identity and verify it matches the Noise static key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// The server identity the client expects to reach.
    pub server_key: [u8; 32],
    /// The sender's own identity.
    pub sender_key: [u8; 32],
}

/// Handshake failures. Collapsed deliberately: a handshake that fails for
/// any reason yields no session and no detail a remote attacker can use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeError;

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "noise handshake failed")
    }
}

impl std::error::Error for HandshakeError {}

fn builder<'a>() -> Result<Builder<'a>, HandshakeError> {
    let params = NOISE_PATTERN.parse().map_err(|_| HandshakeError)?;
    Ok(Builder::new(params))
}

/// Client side: build message 1 addressed to `server`.
pub fn initiate_handshake(
    keypair: &Keypair,
    server: &Identity,
) -> Result<(HandshakeState, Vec<u8>), HandshakeError> {
    let server_static = x25519_from_identity(server).ok_or(HandshakeError)?;
    let mut state = builder()?
        .local_private_key(&keypair.x25519_secret())
        .remote_public_key(&server_static)
        .build_initiator()
        .map_err(|_| HandshakeError)?;

    let hello = HelloPayload {
        server_key: *server.as_bytes(),
        sender_key: keypair.public_key_bytes(),
    };
    let payload = encode(&hello).map_err(|_| HandshakeError)?;
    let mut message = vec![0u8; payload.len() + 128];
    let len = state
        .write_message(&payload, &mut message)
        .map_err(|_| HandshakeError)?;
    message.truncate(len);
    Ok((state, message))
}

/// Server side: consume message 1, verify it addresses us and that the
/// claimed sender identity matches the authenticated Noise static, then
/// produce message 2.
pub fn respond_handshake(
    keypair: &Keypair,
    message1: &[u8],
) -> Result<(StatelessTransportState, Identity, Vec<u8>), HandshakeError> {
    let mut state = builder()?
        .local_private_key(&keypair.x25519_secret())
        .build_responder()
        .map_err(|_| HandshakeError)?;

    let mut payload = vec![0u8; message1.len()];
    let len = state
        .read_message(message1, &mut payload)
        .map_err(|_| HandshakeError)?;
    let hello: HelloPayload = decode_bounded(&payload[..len]).map_err(|_| HandshakeError)?;

    if hello.server_key != keypair.public_key_bytes() {
        return Err(HandshakeError);
    }
    let sender = Identity::from_bytes(hello.sender_key);
    let sender_static = x25519_from_identity(&sender).ok_or(HandshakeError)?;
    match state.get_remote_static() {
        Some(observed) if observed == sender_static => {}
        _ => return Err(HandshakeError),
    }

    let reply = HelloPayload {
        server_key: keypair.public_key_bytes(),
        sender_key: keypair.public_key_bytes(),
    };
    let payload = encode(&reply).map_err(|_| HandshakeError)?;
    let mut message = vec![0u8; payload.len() + 128];
    let len = state
        .write_message(&payload, &mut message)
        .map_err(|_| HandshakeError)?;
    message.truncate(len);

    let transport = state
        .into_stateless_transport_mode()
        .map_err(|_| HandshakeError)?;
    Ok((transport, sender, message))
}

/// Client side: consume message 2 and enter transport mode.
pub fn finish_handshake(
    mut state: HandshakeState,
    message2: &[u8],
) -> Result<StatelessTransportState, HandshakeError> {
    let mut payload = vec![0u8; message2.len()];
    state
        .read_message(message2, &mut payload)
        .map_err(|_| HandshakeError)?;
    state
        .into_stateless_transport_mode()
        .map_err(|_| HandshakeError)
}

// ============================================================================
// Frame codec
// ============================================================================

struct Frame {
    kind: u8,
    seq: u32,
    payload: Vec<u8>,
}

fn encode_frame(kind: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&STREAM_MAGIC);
    out.push(kind);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_frame(data: &[u8]) -> Option<Frame> {
    if data.len() < HEADER_SIZE || data[..4] != STREAM_MAGIC {
        return None;
    }
    let kind = data[4];
    let seq = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
    Some(Frame {
        kind,
        seq,
        payload: data[HEADER_SIZE..].to_vec(),
    })
}

fn data_nonce(seq: u32) -> u64 {
    (seq as u64) * 2
}

fn ack_nonce(ack: u32) -> u64 {
    (ack as u64) * 2 + 1
}

// ============================================================================
// Socket
// ============================================================================

/// Stream lifecycle as observed through [`Socket::state`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// Lookup, relay negotiation or hole-punch still in progress.
    Connecting,
    /// Flow locked, handshake done, bytes moving.
    Open,
    /// Terminal. Carries the error that ended the connection, if any.
    Closed(Option<ConnectError>),
}

enum SocketCommand {
    Write(Vec<u8>, oneshot::Sender<Result<(), StreamError>>),
    End,
    Destroy,
}

/// A reliable, encrypted, bidirectional stream to a remote identity.
///
/// Returned immediately by `connect`; readable once open. All handles are
/// observers onto a driver task, so `Socket` is cheap to clone and every
/// close path is idempotent.
#[derive(Clone)]
pub struct Socket {
    remote_public_key: Identity,
    cmd: mpsc::Sender<SocketCommand>,
    data: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    state: watch::Receiver<SocketState>,
}

impl Socket {
    /// Await the open transition. Returns the terminal error when the
    /// connection failed instead.
    pub async fn wait_open(&self) -> Result<(), ConnectError> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow() {
                SocketState::Open => return Ok(()),
                SocketState::Closed(err) => {
                    return Err(err.clone().unwrap_or(ConnectError::Closed))
                }
                SocketState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(ConnectError::Closed);
            }
        }
    }

    /// Receive the next in-order chunk. `None` once the remote ended the
    /// stream (or it was destroyed).
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.data.lock().await.recv().await
    }

    /// Queue bytes for transmission. Writes before open are buffered and
    /// flushed with the open exchange.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(SocketCommand::Write(bytes.to_vec(), tx))
            .await
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)?
    }

    /// End the write side gracefully. The stream closes once both ends
    /// have ended and all frames are acknowledged.
    pub async fn end(&self) {
        let _ = self.cmd.send(SocketCommand::End).await;
    }

    /// Tear the connection down immediately. Idempotent.
    pub async fn destroy(&self) {
        let _ = self.cmd.send(SocketCommand::Destroy).await;
    }

    /// Await the terminal state.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        loop {
            if matches!(&*state.borrow(), SocketState::Closed(_)) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// The terminal error, once closed with one.
    pub fn error(&self) -> Option<ConnectError> {
        match &*self.state.borrow() {
            SocketState::Closed(err) => err.clone(),
            _ => None,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state.borrow().clone()
    }

    pub fn remote_public_key(&self) -> Identity {
        self.remote_public_key
    }
}

/// Driver-side handle for the phase before a flow exists. The connector
/// holds this while looking up, relaying and punching; the server side
/// starts the stream straight away.
pub(crate) struct SocketDriver {
    cmd_rx: mpsc::Receiver<SocketCommand>,
    data_tx: mpsc::Sender<Vec<u8>>,
    state_tx: watch::Sender<SocketState>,
}

/// Create a socket handle and its driver side.
pub(crate) fn socket_pair(remote_public_key: Identity) -> (Socket, SocketDriver) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (data_tx, data_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
    (
        Socket {
            remote_public_key,
            cmd: cmd_tx,
            data: Arc::new(Mutex::new(data_rx)),
            state: state_rx,
        },
        SocketDriver {
            cmd_rx,
            data_tx,
            state_tx,
        },
    )
}

impl SocketDriver {
    /// Fail the connection before any flow was established.
    pub fn fail(self, error: ConnectError) {
        let _ = self.state_tx.send(SocketState::Closed(Some(error)));
    }

    /// Hand a locked flow to the stream loop. Consumes the driver; the
    /// spawned task owns the socket for the rest of the connection.
    pub fn start(
        self,
        socket: UdpSocket,
        remote: SocketAddr,
        transport: StatelessTransportState,
        fast_open: bool,
    ) {
        tokio::spawn(async move {
            let mut stream = StreamLoop {
                socket,
                remote,
                transport,
                cmd_rx: self.cmd_rx,
                data_tx: Some(self.data_tx),
                state_tx: self.state_tx,
                fast_open,
                next_seq: 0,
                pending: VecDeque::new(),
                backlog: VecDeque::new(),
                expected_seq: 0,
                reorder: BTreeMap::new(),
                peer_ended: false,
                local_end_queued: false,
                open_seen_payload: false,
            };
            stream.run().await;
        });
    }
}

struct PendingFrame {
    kind: u8,
    seq: u32,
    payload: Vec<u8>,
    last_sent: Instant,
    retries: u32,
}

/// What was waiting in the command queue when the flow locked.
enum FirstCommand {
    Write,
    End,
    Destroy,
}

struct StreamLoop {
    socket: UdpSocket,
    remote: SocketAddr,
    transport: StatelessTransportState,
    cmd_rx: mpsc::Receiver<SocketCommand>,
    data_tx: Option<mpsc::Sender<Vec<u8>>>,
    state_tx: watch::Sender<SocketState>,
    fast_open: bool,
    next_seq: u32,
    pending: VecDeque<PendingFrame>,
    backlog: VecDeque<(u8, Vec<u8>)>,
    expected_seq: u32,
    reorder: BTreeMap<u32, (u8, Vec<u8>)>,
    peer_ended: bool,
    local_end_queued: bool,
    open_seen_payload: bool,
}

impl StreamLoop {
    async fn run(&mut self) {
        // The open frame carries the first buffered write when fast-open is
        // on, saving a round trip for write-then-read clients.
        let (first_payload, first_cmd) = if self.fast_open {
            self.take_first_write()
        } else {
            (Vec::new(), FirstCommand::Write)
        };
        if self.queue_frame(frame_type::OPEN, first_payload).await.is_err() {
            self.close(Some(ConnectError::Stream(StreamError::Crypto)));
            return;
        }
        match first_cmd {
            FirstCommand::Write => {}
            FirstCommand::End => self.queue_end().await,
            FirstCommand::Destroy => {
                let close = encode_frame(frame_type::CLOSE, 0, &[]);
                for _ in 0..3 {
                    let _ = self.socket.send_to(&close, self.remote).await;
                }
                self.close(None);
                return;
            }
        }

        let mut tick = interval(RETRANSMIT_TICK);
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                incoming = self.socket.recv_from(&mut buf) => {
                    match incoming {
                        Ok((len, from)) => {
                            if from != self.remote {
                                continue;
                            }
                            let bytes = buf[..len].to_vec();
                            if self.handle_datagram(&bytes).await {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "stream socket recv failed");
                            self.close(Some(ConnectError::Stream(StreamError::Io(
                                err.to_string(),
                            ))));
                            return;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Write(bytes, done)) => {
                            let result = self.queue_write(bytes).await;
                            let _ = done.send(result);
                        }
                        Some(SocketCommand::End) => {
                            self.queue_end().await;
                        }
                        Some(SocketCommand::Destroy) | None => {
                            // Best-effort teardown hint; the peer also times
                            // out on retransmissions if this is lost.
                            let close = encode_frame(frame_type::CLOSE, 0, &[]);
                            for _ in 0..3 {
                                let _ = self.socket.send_to(&close, self.remote).await;
                            }
                            self.close(None);
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if self.retransmit().await {
                        return;
                    }
                }
            }
            if self.finished() {
                self.close(None);
                return;
            }
        }
    }

    /// Take a write already queued before the flow locked so its payload
    /// can ride the open frame. A queued end or destroy is reported back to
    /// the caller instead of being handled here.
    fn take_first_write(&mut self) -> (Vec<u8>, FirstCommand) {
        match self.cmd_rx.try_recv() {
            Ok(SocketCommand::Write(bytes, done)) => {
                let _ = done.send(Ok(()));
                (bytes, FirstCommand::Write)
            }
            Ok(SocketCommand::End) => (Vec::new(), FirstCommand::End),
            Ok(SocketCommand::Destroy) => (Vec::new(), FirstCommand::Destroy),
            Err(_) => (Vec::new(), FirstCommand::Write),
        }
    }

    async fn queue_write(&mut self, bytes: Vec<u8>) -> Result<(), StreamError> {
        if self.local_end_queued {
            return Err(StreamError::Closed);
        }
        for chunk in bytes.chunks(MAX_FRAME_PAYLOAD.max(1)) {
            self.queue_frame(frame_type::DATA, chunk.to_vec()).await?;
        }
        if bytes.is_empty() {
            // Zero-length writes still need a frame so ordering observes
            // them; deliver as an empty chunk.
            self.queue_frame(frame_type::DATA, Vec::new()).await?;
        }
        Ok(())
    }

    async fn queue_end(&mut self) {
        if self.local_end_queued {
            return;
        }
        self.local_end_queued = true;
        let _ = self.queue_frame(frame_type::END, Vec::new()).await;
    }

    async fn queue_frame(&mut self, kind: u8, payload: Vec<u8>) -> Result<(), StreamError> {
        if self.pending.len() >= MAX_WINDOW {
            self.backlog.push_back((kind, payload));
            return Ok(());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send_sealed(kind, seq, &payload).await?;
        self.pending.push_back(PendingFrame {
            kind,
            seq,
            payload,
            last_sent: Instant::now(),
            retries: 0,
        });
        Ok(())
    }

    async fn send_sealed(&mut self, kind: u8, seq: u32, payload: &[u8]) -> Result<(), StreamError> {
        let mut sealed = vec![0u8; payload.len() + 16];
        let len = self
            .transport
            .write_message(data_nonce(seq), payload, &mut sealed)
            .map_err(|_| StreamError::Crypto)?;
        sealed.truncate(len);
        let frame = encode_frame(kind, seq, &sealed);
        self.socket
            .send_to(&frame, self.remote)
            .await
            .map_err(|err| StreamError::Io(err.to_string()))?;
        Ok(())
    }

    async fn send_ack(&mut self) {
        let ack = self.expected_seq;
        let mut sealed = vec![0u8; 16];
        let Ok(len) = self
            .transport
            .write_message(ack_nonce(ack), &[], &mut sealed)
        else {
            return;
        };
        sealed.truncate(len);
        let frame = encode_frame(frame_type::ACK, ack, &sealed);
        let _ = self.socket.send_to(&frame, self.remote).await;
    }

    /// Returns true when the loop should exit.
    async fn handle_datagram(&mut self, bytes: &[u8]) -> bool {
        let Some(frame) = decode_frame(bytes) else {
            // Late hole-punch probes and junk land here.
            return false;
        };
        match frame.kind {
            frame_type::CLOSE => {
                debug!(remote = %self.remote, "stream closed by peer");
                self.close(None);
                return true;
            }
            frame_type::ACK => {
                let mut opened = vec![0u8; 16];
                if self
                    .transport
                    .read_message(ack_nonce(frame.seq), &frame.payload, &mut opened)
                    .is_err()
                {
                    return false;
                }
                while let Some(front) = self.pending.front() {
                    if front.seq < frame.seq {
                        self.pending.pop_front();
                    } else {
                        break;
                    }
                }
                self.refill_window().await;
                false
            }
            frame_type::OPEN | frame_type::DATA | frame_type::END => {
                let mut opened = vec![0u8; frame.payload.len()];
                let Ok(len) = self.transport.read_message(
                    data_nonce(frame.seq),
                    &frame.payload,
                    &mut opened,
                ) else {
                    return false;
                };
                opened.truncate(len);
                if frame.seq >= self.expected_seq {
                    self.reorder.insert(frame.seq, (frame.kind, opened));
                    self.deliver_in_order().await;
                }
                self.send_ack().await;
                false
            }
            other => {
                trace!(kind = other, "unknown stream frame dropped");
                false
            }
        }
    }

    async fn deliver_in_order(&mut self) {
        while let Some((kind, payload)) = self.reorder.remove(&self.expected_seq) {
            self.expected_seq += 1;
            match kind {
                frame_type::OPEN => {
                    let _ = self.state_tx.send_if_modified(|state| {
                        if matches!(state, SocketState::Connecting) {
                            *state = SocketState::Open;
                            true
                        } else {
                            false
                        }
                    });
                    if !payload.is_empty() && !self.open_seen_payload {
                        self.open_seen_payload = true;
                        if let Some(tx) = &self.data_tx {
                            let _ = tx.send(payload).await;
                        }
                    }
                }
                frame_type::DATA => {
                    if let Some(tx) = &self.data_tx {
                        let _ = tx.send(payload).await;
                    }
                }
                frame_type::END => {
                    self.peer_ended = true;
                    // Closing the data channel is the reader's end-of-stream.
                    self.data_tx = None;
                }
                _ => {}
            }
        }
    }

    async fn refill_window(&mut self) {
        while self.pending.len() < MAX_WINDOW {
            let Some((kind, payload)) = self.backlog.pop_front() else {
                return;
            };
            let seq = self.next_seq;
            self.next_seq += 1;
            if self.send_sealed(kind, seq, &payload).await.is_err() {
                return;
            }
            self.pending.push_back(PendingFrame {
                kind,
                seq,
                payload,
                last_sent: Instant::now(),
                retries: 0,
            });
        }
    }

    /// Returns true when the loop should exit.
    async fn retransmit(&mut self) -> bool {
        let mut failed = false;
        let mut resend = Vec::new();
        for frame in &mut self.pending {
            if frame.last_sent.elapsed() < RETRANSMIT_TICK {
                continue;
            }
            if frame.retries >= MAX_RETRANSMITS {
                failed = true;
                break;
            }
            frame.retries += 1;
            frame.last_sent = Instant::now();
            resend.push((frame.kind, frame.seq, frame.payload.clone()));
        }
        if failed {
            self.close(Some(ConnectError::Stream(StreamError::RetriesExhausted)));
            return true;
        }
        for (kind, seq, payload) in resend {
            if self.send_sealed(kind, seq, &payload).await.is_err() {
                self.close(Some(ConnectError::Stream(StreamError::Crypto)));
                return true;
            }
        }
        false
    }

    /// Graceful completion: both sides ended and everything we sent is
    /// acknowledged.
    fn finished(&self) -> bool {
        self.peer_ended
            && self.local_end_queued
            && self.pending.is_empty()
            && self.backlog.is_empty()
    }

    fn close(&mut self, error: Option<ConnectError>) {
        self.data_tx = None;
        let _ = self.state_tx.send_if_modified(move |state| {
            if matches!(state, SocketState::Closed(_)) {
                return false;
            }
            *state = SocketState::Closed(error);
            true
        });
    }
}
