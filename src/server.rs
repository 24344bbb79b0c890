//! # Server
//!
//! Owns a service keypair, announces `hash(publicKey)` to the DHT, and
//! admits inbound connections forwarded by its relays.
//!
//! ## Actor layout
//!
//! [`Server`] is the public handle; `ServerActor` owns all state and runs on
//! its own task. The router entry installed at listen time carries the
//! actor's action channel, so connect and hole-punch requests dispatched by
//! the node land in the same loop that owns the sessions.
//!
//! ## Announce lifecycle
//!
//! Listen walks a lookup toward the target and announces to every node that
//! answered, binding each signature to that node's id and round-trip token.
//! A refresh loop then renews the records cheaply by revealing hash-chain
//! links, falling back to a full re-announce when the chain runs dry or a
//! storer stops answering. Close unannounces everywhere and cancels punches
//! in flight.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::crypto::{sign_announce, RefreshChain, NS_ANNOUNCE, NS_UNANNOUNCE};
use crate::holepunch::{FirewallClass, HolepunchHook, Puncher, Strategy, PROBE_INTERVAL};
use crate::identity::{Identity, Keypair, Target};
use crate::messages::{
    decode_bounded, encode, punch_mode, Announce, Command, ConnectPayload, ConnectReply,
    Holepunch, NodeAddr, PeerAddress, PeerRecord, PunchInfo,
};
use crate::node::NodeHandle;
use crate::protocols::SwarmRpc;
use crate::router::RouterAction;
use crate::rpc::ReplyBody;
use crate::transport::{respond_handshake, socket_pair, Socket};
use snow::StatelessTransportState;

/// Cheap renewals per announce before a full re-announce.
const REFRESH_CHAIN_LINKS: usize = 64;

/// Admitted sessions that never progressed to punching are dropped after
/// this long.
const PENDING_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Admission decision on a remote public key.
pub type FirewallHook = Arc<dyn Fn(&[u8; 32]) -> bool + Send + Sync>;

/// Options for `create_server`.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Service keypair; a fresh one is generated when unset.
    pub keypair: Option<Keypair>,
    /// Admission check invoked with each connecting identity.
    pub firewall: Option<FirewallHook>,
    /// Veto hook consulted before probing starts.
    pub holepunch: Option<HolepunchHook>,
}

enum ServerCommand {
    Listen {
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a listening (or closeable) server.
pub struct Server {
    public_key: Identity,
    cmd: mpsc::Sender<ServerCommand>,
    conns: Mutex<mpsc::Receiver<Socket>>,
}

impl Server {
    /// The service identity clients dial.
    pub fn public_key(&self) -> Identity {
        self.public_key
    }

    /// Announce and start accepting connections.
    pub async fn listen(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd
            .send(ServerCommand::Listen { done: done_tx })
            .await
            .map_err(|_| anyhow!("server closed"))?;
        done_rx.await.map_err(|_| anyhow!("server closed"))?
    }

    /// The next admitted connection, or `None` once closed.
    pub async fn accept(&self) -> Option<Socket> {
        self.conns.lock().await.recv().await
    }

    /// Unannounce everywhere and release the router entry. Idempotent;
    /// pending hole-punches are cancelled.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd
            .send(ServerCommand::Close { done: done_tx })
            .await
            .is_err()
        {
            return; // Already closed.
        }
        let _ = done_rx.await;
    }
}

/// Internal close handle kept by the node so `destroy` can shut down every
/// server it spawned.
pub(crate) struct ServerCloser {
    cmd: mpsc::Sender<ServerCommand>,
}

impl ServerCloser {
    pub(crate) async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd
            .send(ServerCommand::Close { done: done_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

/// Spawn a server actor. Called by the node facade.
pub(crate) fn spawn_server<R: SwarmRpc>(
    rpc: R,
    node: NodeHandle,
    keypair: Keypair,
    local_class: FirewallClass,
    bind_ip: IpAddr,
    share_local_address: bool,
    fast_open: bool,
    refresh_interval: Duration,
    options: ServerOptions,
) -> (Server, ServerCloser) {
    let public_key = keypair.identity();
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (actions_tx, actions_rx) = mpsc::channel(64);
    let (accept_tx, accept_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let actor = ServerActor {
        rpc,
        node,
        keypair,
        local_class,
        bind_ip,
        share_local_address,
        fast_open,
        refresh_interval,
        options,
        actions_tx,
        accept_tx,
        cancel_tx,
        cancel_rx,
        listening: false,
        announced: Vec::new(),
        chain: None,
        record: None,
        sessions: HashMap::new(),
    };
    tokio::spawn(actor.run(cmd_rx, actions_rx));

    let server = Server {
        public_key,
        cmd: cmd_tx.clone(),
        conns: Mutex::new(accept_rx),
    };
    (server, ServerCloser { cmd: cmd_tx })
}

struct AnnouncedPeer {
    node: NodeAddr,
    token: [u8; 32],
}

struct PunchSession {
    puncher: Puncher,
    transport: StatelessTransportState,
    client: Identity,
    remote_candidates: Vec<PeerAddress>,
    remote_class: FirewallClass,
    created_at: Instant,
}

struct ServerActor<R: SwarmRpc> {
    rpc: R,
    node: NodeHandle,
    keypair: Keypair,
    local_class: FirewallClass,
    bind_ip: IpAddr,
    share_local_address: bool,
    fast_open: bool,
    refresh_interval: Duration,
    options: ServerOptions,
    actions_tx: mpsc::Sender<RouterAction>,
    accept_tx: mpsc::Sender<Socket>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    listening: bool,
    announced: Vec<AnnouncedPeer>,
    chain: Option<RefreshChain>,
    record: Option<PeerRecord>,
    sessions: HashMap<[u8; 16], PunchSession>,
}

impl<R: SwarmRpc> ServerActor<R> {
    fn target(&self) -> Target {
        crate::crypto::hash(&self.keypair.public_key_bytes())
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ServerCommand>,
        mut actions_rx: mpsc::Receiver<RouterAction>,
    ) {
        let mut refresh = interval(self.refresh_interval);
        refresh.tick().await; // First tick completes immediately.
        let mut cleanup = interval(PENDING_SESSION_TIMEOUT);
        cleanup.tick().await;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ServerCommand::Listen { done }) => {
                            let _ = done.send(self.listen().await);
                        }
                        Some(ServerCommand::Close { done }) => {
                            self.close().await;
                            let _ = done.send(());
                            return;
                        }
                        None => {
                            self.close().await;
                            return;
                        }
                    }
                }
                action = actions_rx.recv() => {
                    match action {
                        Some(RouterAction::Connect { from, payload, reply }) => {
                            self.handle_connect(from, payload, reply).await;
                        }
                        Some(RouterAction::Holepunch { from, payload, reply }) => {
                            self.handle_holepunch(from, payload, reply).await;
                        }
                        None => {}
                    }
                }
                _ = refresh.tick() => {
                    if self.listening {
                        self.refresh_announces().await;
                    }
                }
                _ = cleanup.tick() => {
                    self.expire_sessions();
                }
            }
        }
    }

    // ========================================================================
    // Announce lifecycle
    // ========================================================================

    async fn listen(&mut self) -> Result<()> {
        if self.listening {
            return Err(anyhow!("server is already listening"));
        }

        let record = self.build_record().await;
        let record_bytes = encode(&record)?;
        self.record = Some(record);
        self.node
            .install_local(self.target(), record_bytes, self.actions_tx.clone())
            .await;

        self.announce_everywhere().await?;
        self.listening = true;
        info!(server = %self.keypair.identity(), "server listening");
        Ok(())
    }

    /// The record clients discover: our reflexive address, plus bound local
    /// addresses when same-LAN connects are wanted.
    async fn build_record(&self) -> PeerRecord {
        let mut addresses = Vec::new();
        let mut replies = self.rpc.query(Command::Lookup, self.target(), None).await;
        if let Some(reply) = replies.recv().await {
            if let Ok(observed) = self.rpc.ping_observed(reply.from).await {
                addresses.push(observed);
            }
        }
        if self.share_local_address {
            if let Some(local) = PeerAddress::from_socket_addr(self.rpc.local().addr) {
                if !addresses.contains(&local) {
                    addresses.push(local);
                }
            }
        }
        PeerRecord {
            public_key: self.keypair.public_key_bytes(),
            relay_addresses: addresses,
            relay_auth: None,
        }
    }

    async fn announce_everywhere(&mut self) -> Result<()> {
        let target = self.target();
        let record = self
            .record
            .clone()
            .ok_or_else(|| anyhow!("no record built"))?;
        let peer_bytes = encode(&record)?;
        let chain = RefreshChain::generate(REFRESH_CHAIN_LINKS);
        let head = chain.head();

        self.announced.clear();
        let mut replies = self.rpc.query(Command::Lookup, target, None).await;
        while let Some(reply) = replies.recv().await {
            let Some(token) = reply.token else {
                continue;
            };
            let signature = sign_announce(
                &self.keypair,
                NS_ANNOUNCE,
                &target,
                &reply.from.id,
                &token,
                &peer_bytes,
                Some(&head),
            );
            let announce = Announce {
                peer: Some(record.clone()),
                refresh: Some(head),
                signature: Some(signature.to_vec()),
            };
            let value = encode(&announce)?;
            match self
                .rpc
                .request(reply.from, Command::Announce, target, Some(value), Some(token))
                .await
            {
                Ok(ack) => {
                    self.announced.push(AnnouncedPeer {
                        node: reply.from,
                        token: ack.token.unwrap_or(token),
                    });
                }
                Err(err) => {
                    trace!(node = %reply.from.addr, %err, "announce hop failed");
                }
            }
        }

        if self.announced.is_empty() {
            return Err(anyhow!("no node accepted the announce"));
        }
        self.chain = Some(chain);
        debug!(
            server = %self.keypair.identity(),
            storers = self.announced.len(),
            "announced"
        );
        Ok(())
    }

    /// Renew records with the next chain link; re-announce from scratch when
    /// the chain runs dry or a storer went away.
    async fn refresh_announces(&mut self) {
        let renewals_left = self
            .chain
            .as_ref()
            .map(|chain| chain.remaining())
            .unwrap_or(0);
        if renewals_left == 0 {
            if let Err(err) = self.announce_everywhere().await {
                warn!(%err, "re-announce failed");
            }
            return;
        }
        let Some(token) = self.chain.as_mut().and_then(|chain| chain.advance()) else {
            return;
        };

        let target = self.target();
        let renewal = Announce {
            peer: None,
            refresh: Some(token),
            signature: None,
        };
        let Ok(value) = encode(&renewal) else {
            return;
        };
        let mut lost_peer = false;
        for peer in &mut self.announced {
            match self
                .rpc
                .request(peer.node, Command::Announce, target, Some(value.clone()), None)
                .await
            {
                Ok(reply) => {
                    if let Some(fresh) = reply.token {
                        peer.token = fresh;
                    }
                }
                Err(_) => {
                    lost_peer = true;
                }
            }
        }
        if lost_peer {
            if let Err(err) = self.announce_everywhere().await {
                warn!(%err, "re-announce after lost storer failed");
            }
        }
    }

    async fn close(&mut self) {
        if !self.listening && self.announced.is_empty() {
            let _ = self.cancel_tx.send(true);
            return;
        }
        let _ = self.cancel_tx.send(true);

        let target = self.target();
        if let Some(record) = &self.record {
            if let Ok(peer_bytes) = encode(record) {
                for peer in &self.announced {
                    let signature = sign_announce(
                        &self.keypair,
                        NS_UNANNOUNCE,
                        &target,
                        &peer.node.id,
                        &peer.token,
                        &peer_bytes,
                        None,
                    );
                    let announce = Announce {
                        peer: Some(record.clone()),
                        refresh: None,
                        signature: Some(signature.to_vec()),
                    };
                    if let Ok(value) = encode(&announce) {
                        let _ = self
                            .rpc
                            .request(
                                peer.node,
                                Command::Unannounce,
                                target,
                                Some(value),
                                Some(peer.token),
                            )
                            .await;
                    }
                }
            }
        }

        self.node.remove_local(target).await;
        self.announced.clear();
        self.sessions.clear();
        self.listening = false;
        info!(server = %self.keypair.identity(), "server closed");
    }

    // ========================================================================
    // Connection admission
    // ========================================================================

    async fn handle_connect(
        &mut self,
        from: NodeAddr,
        payload: ConnectPayload,
        reply: oneshot::Sender<ReplyBody>,
    ) {
        let Ok((transport, client, message2)) =
            respond_handshake(&self.keypair, &payload.handshake)
        else {
            debug!("connect dropped: handshake rejected");
            return;
        };
        if let Some(firewall) = &self.options.firewall {
            if !firewall(client.as_bytes()) {
                debug!(client = %client, "connect dropped: admission declined");
                return;
            }
        }

        let Ok(puncher) =
            Puncher::bind(self.bind_ip, self.local_class, self.cancel_rx.clone()).await
        else {
            return;
        };
        let local_candidate = PeerAddress::from_socket_addr(puncher.local_addr());

        let mut remote_candidates = Vec::new();
        if let Some(observed) = payload.observed {
            remote_candidates.push(observed);
        }
        for address in &payload.addresses {
            if !remote_candidates.contains(address) {
                remote_candidates.push(*address);
            }
        }
        let remote_class =
            FirewallClass::from_wire(payload.firewall).unwrap_or(FirewallClass::Random);

        trace!(client = %client, from = %from.addr, "connection admitted, awaiting punch");
        self.sessions.insert(
            payload.session,
            PunchSession {
                puncher,
                transport,
                client,
                remote_candidates,
                remote_class,
                created_at: Instant::now(),
            },
        );

        let connect_reply = ConnectReply {
            handshake: message2,
            firewall: self.local_class.to_wire(),
            addresses: local_candidate.into_iter().collect(),
        };
        if let Ok(value) = encode(&connect_reply) {
            let _ = reply.send(ReplyBody::with_value(value));
        }
    }

    async fn handle_holepunch(
        &mut self,
        _from: NodeAddr,
        payload: Holepunch,
        reply: oneshot::Sender<ReplyBody>,
    ) {
        let Ok(info) = decode_bounded::<PunchInfo>(&payload.payload) else {
            return;
        };

        match payload.mode {
            punch_mode::ABORT => {
                // Client-side veto: forget the pending session quietly.
                self.sessions.remove(&info.session);
                let _ = reply.send(ReplyBody::empty());
            }
            punch_mode::OFFER => {
                let Some(mut session) = self.sessions.remove(&info.session) else {
                    return;
                };
                let remote_class =
                    FirewallClass::from_wire(info.firewall).unwrap_or(session.remote_class);

                let mut candidates = session.remote_candidates.clone();
                if let Some(observed) = info.observed {
                    if !candidates.contains(&observed) {
                        candidates.insert(0, observed);
                    }
                }
                for address in &info.candidates {
                    if !candidates.contains(address) {
                        candidates.push(*address);
                    }
                }

                if let Some(hook) = &self.options.holepunch {
                    let remote_addr = candidates
                        .first()
                        .map(|a| a.socket_addr())
                        .unwrap_or(session.puncher.local_addr());
                    if !hook(
                        remote_class,
                        self.local_class,
                        remote_addr,
                        session.puncher.local_addr(),
                    ) {
                        debug!(client = %session.client, "hole punch vetoed by server hook");
                        let abort = Holepunch {
                            mode: punch_mode::ABORT,
                            payload: Vec::new(),
                        };
                        if let Ok(value) = encode(&abort) {
                            let _ = reply.send(ReplyBody::with_value(value));
                        }
                        return;
                    }
                }

                let answer_info = PunchInfo {
                    session: info.session,
                    round: info.round,
                    firewall: self.local_class.to_wire(),
                    candidates: PeerAddress::from_socket_addr(session.puncher.local_addr())
                        .into_iter()
                        .collect(),
                    delay_ms: 0,
                    observed: None,
                };
                let answer = Holepunch {
                    mode: punch_mode::ANSWER,
                    payload: match encode(&answer_info) {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    },
                };
                let Ok(value) = encode(&answer) else {
                    return;
                };
                let _ = reply.send(ReplyBody::with_value(value));

                // Probe concurrently with the client; the answer reply is
                // its starting gun.
                let start_delay = match strategy_delay(self.local_class, remote_class) {
                    Some(delay) => delay,
                    None => return, // Unreachable; both sides fail locally.
                };
                let accept_tx = self.accept_tx.clone();
                let fast_open = self.fast_open;
                tokio::spawn(async move {
                    match session
                        .puncher
                        .punch(&candidates, remote_class, start_delay)
                        .await
                    {
                        Ok((socket, remote_addr)) => {
                            let (handle, driver) = socket_pair(session.client);
                            driver.start(socket, remote_addr, session.transport, fast_open);
                            if accept_tx.send(handle).await.is_err() {
                                trace!("server closed while a punch completed");
                            }
                        }
                        Err(err) => {
                            debug!(client = %session.client, %err, "server-side punch failed");
                        }
                    }
                });
            }
            _ => {}
        }
    }

    fn expire_sessions(&mut self) {
        self.sessions
            .retain(|_, session| session.created_at.elapsed() < PENDING_SESSION_TIMEOUT);
    }
}

/// Probe stagger for the admitted side; `None` when the classes cannot
/// traverse at all.
fn strategy_delay(local: FirewallClass, remote: FirewallClass) -> Option<Duration> {
    match crate::holepunch::strategy(local, remote) {
        Strategy::Unreachable => None,
        Strategy::Direct { probe_first: false } => Some(PROBE_INTERVAL),
        _ => Some(Duration::ZERO),
    }
}
