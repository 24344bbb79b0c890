//! # Node Facade
//!
//! A [`Dht`] is one overlay node: a keypair, a UDP endpoint, and the actor
//! that owns this node's record [`Store`](crate::store::Store) and
//! [`Router`](crate::router::Router). Everything else hangs off it:
//!
//! ```ignore
//! let net = MeshNet::new();
//! let dht = Dht::bind(&net, DhtOptions::default()).await?;
//!
//! let server = dht.create_server(ServerOptions::default()).await?;
//! server.listen().await?;
//!
//! let socket = other.connect(server.public_key(), ConnectOptions::default()).await;
//! socket.wait_open().await?;
//! ```
//!
//! ## Actor layout
//!
//! The `NodeActor` serialises every store and router mutation on one task:
//! inbound RPC requests, server registrations, and the expiry sweep all run
//! through its loop. Relay forwarding (connect and hole-punch requests for
//! targets another node announced to us) is spawned off the loop so a slow
//! next hop never stalls record serving.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OnceCell};
use tokio::time::{interval, Duration};
use tracing::{debug, trace, warn};

use crate::connect::{spawn_connect, ConnectContext, ConnectOptions};
use crate::crypto;
use crate::holepunch::{classify, FirewallClass};
use crate::identity::{Identity, Keypair, Target};
use crate::messages::{
    decode_bounded, encode, Command, ErrorCode, MutableGet, MutablePut, MutableRecord,
    MutableSignable, NodeAddr, PeerAddress,
};
use crate::protocols::SwarmRpc;
use crate::router::{Router, RouterAction, RouterEntry};
use crate::rpc::{InboundRequest, MeshNet, MeshRpc, ReplyBody};
use crate::server::{spawn_server, Server, ServerCloser, ServerOptions};
use crate::store::{Store, StoreConfig};
use crate::transport::{socket_pair, Socket};

/// Interval of the store expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Node configuration with typed defaults.
#[derive(Clone, Debug)]
pub struct DhtOptions {
    /// UDP endpoint to bind; port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Bootstrap nodes, consumed by networked RPC layers. The in-process
    /// mesh is already converged and ignores it.
    pub bootstrap: Vec<SocketAddr>,
    /// Ephemeral nodes answer direct requests but stay out of query
    /// iteration, so nothing is stored on them.
    pub ephemeral: bool,
    /// Classify the firewall from reply observations alone instead of
    /// running the slower unsolicited-probe test.
    pub quick_firewall: bool,
    /// Advertise bound local addresses in announce records, enabling
    /// same-LAN shortcuts.
    pub share_local_address: bool,
    /// Piggyback the first write onto the stream open exchange.
    pub fast_open: bool,
    /// Record-store slots per cache.
    pub max_size: usize,
    /// Record TTL; announces refresh at 5/6 of it.
    pub max_age: Duration,
}

impl Default for DhtOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("static address parses"),
            bootstrap: Vec::new(),
            ephemeral: false,
            quick_firewall: true,
            share_local_address: false,
            fast_open: true,
            max_size: 65_536,
            max_age: Duration::from_secs(30 * 60),
        }
    }
}

pub(crate) enum NodeCommand {
    InstallLocal {
        target: Target,
        record: Vec<u8>,
        actions: mpsc::Sender<RouterAction>,
        done: oneshot::Sender<()>,
    },
    RemoveLocal {
        target: Target,
        done: oneshot::Sender<()>,
    },
    AnnounceCount {
        target: Target,
        done: oneshot::Sender<usize>,
    },
}

/// Cheap handle servers use to reach the node actor.
#[derive(Clone)]
pub(crate) struct NodeHandle {
    cmd: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    pub(crate) async fn install_local(
        &self,
        target: Target,
        record: Vec<u8>,
        actions: mpsc::Sender<RouterAction>,
    ) {
        let (done, wait) = oneshot::channel();
        if self
            .cmd
            .send(NodeCommand::InstallLocal {
                target,
                record,
                actions,
                done,
            })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
    }

    pub(crate) async fn remove_local(&self, target: Target) {
        let (done, wait) = oneshot::channel();
        if self
            .cmd
            .send(NodeCommand::RemoveLocal { target, done })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
    }

    async fn announce_count(&self, target: Target) -> usize {
        let (done, wait) = oneshot::channel();
        if self
            .cmd
            .send(NodeCommand::AnnounceCount { target, done })
            .await
            .is_err()
        {
            return 0;
        }
        wait.await.unwrap_or(0)
    }
}

/// One overlay node.
pub struct Dht<R: SwarmRpc = MeshRpc> {
    inner: Arc<DhtInner<R>>,
}

impl<R: SwarmRpc> Clone for Dht<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DhtInner<R: SwarmRpc> {
    rpc: R,
    keypair: Keypair,
    options: DhtOptions,
    handle: NodeHandle,
    probe_socket: Arc<UdpSocket>,
    firewall: OnceCell<FirewallClass>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    servers: Mutex<Vec<ServerCloser>>,
    destroyed: AtomicBool,
}

impl Dht<MeshRpc> {
    /// Bind a node onto an in-process mesh.
    pub async fn bind(net: &MeshNet, options: DhtOptions) -> Result<Self> {
        let keypair = Keypair::generate();
        let probe_socket = UdpSocket::bind(options.bind)
            .await
            .context("failed to bind node socket")?;
        let addr = probe_socket.local_addr()?;
        let id = crypto::hash(&keypair.public_key_bytes());

        let (inbound_tx, inbound_rx) = mpsc::channel(MeshNet::inbound_queue());
        let rpc = net
            .join(NodeAddr { id, addr }, inbound_tx, options.ephemeral)
            .await;
        Self::with_rpc(rpc, inbound_rx, keypair, probe_socket, options)
    }
}

impl<R: SwarmRpc> Dht<R> {
    /// Assemble a node over any RPC implementation. `inbound` must deliver
    /// the requests the RPC layer receives for this node.
    pub fn with_rpc(
        rpc: R,
        inbound: mpsc::Receiver<InboundRequest>,
        keypair: Keypair,
        probe_socket: UdpSocket,
        options: DhtOptions,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let actor = NodeActor {
            id: rpc.local().id,
            rpc: rpc.clone(),
            store: Store::new(StoreConfig {
                max_size: options.max_size,
                max_age: options.max_age,
            }),
            router: Router::new(),
        };
        tokio::spawn(actor.run(inbound, cmd_rx, cancel_rx.clone()));

        Ok(Self {
            inner: Arc::new(DhtInner {
                rpc,
                keypair,
                options,
                handle: NodeHandle { cmd: cmd_tx },
                probe_socket: Arc::new(probe_socket),
                firewall: OnceCell::new(),
                cancel_tx,
                cancel_rx,
                servers: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn host(&self) -> IpAddr {
        self.inner.rpc.local().addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.inner.rpc.local().addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.rpc.local().addr
    }

    /// The node's default keypair, used for servers and connections that do
    /// not bring their own.
    pub fn default_keypair(&self) -> Keypair {
        self.inner.keypair.clone()
    }

    /// Resolve the firewall classification, classifying on first use.
    pub async fn firewall_class(&self) -> FirewallClass {
        *self
            .inner
            .firewall
            .get_or_init(|| async {
                let class = classify(
                    &self.inner.rpc,
                    &self.inner.probe_socket,
                    self.inner.options.quick_firewall,
                )
                .await;
                debug!(node = %self.local_addr(), %class, "firewall classified");
                class
            })
            .await
    }

    /// Whether inbound traffic is assumed filtered. `true` until a
    /// classification has shown otherwise.
    pub fn firewalled(&self) -> bool {
        match self.inner.firewall.get() {
            Some(class) => *class != FirewallClass::Open,
            None => true,
        }
    }

    /// Classify the firewall and settle in. On the in-process mesh there is
    /// no bootstrap walk to wait for.
    pub async fn ready(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("node destroyed"));
        }
        self.firewall_class().await;
        Ok(())
    }

    /// Create a server bound to this node. It does not announce until
    /// `listen`.
    pub async fn create_server(&self, options: ServerOptions) -> Result<Server> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("node destroyed"));
        }
        let class = self.firewall_class().await;
        let keypair = options
            .keypair
            .clone()
            .unwrap_or_else(|| self.inner.keypair.clone());
        let refresh_interval = self.inner.options.max_age.mul_f64(5.0 / 6.0);
        let (server, closer) = spawn_server(
            self.inner.rpc.clone(),
            self.inner.handle.clone(),
            keypair,
            class,
            self.host(),
            self.inner.options.share_local_address,
            self.inner.options.fast_open,
            refresh_interval,
            options,
        );
        self.inner.servers.lock().await.push(closer);
        Ok(server)
    }

    /// Open a stream to a remote server identity. Returns immediately; the
    /// socket resolves to open or a terminal error.
    pub async fn connect(&self, remote_public_key: Identity, options: ConnectOptions) -> Socket {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            let (socket, driver) = socket_pair(remote_public_key);
            driver.fail(crate::connect::ConnectError::Closed);
            return socket;
        }
        let class = self.firewall_class().await;
        let ctx = ConnectContext {
            rpc: self.inner.rpc.clone(),
            keypair: options
                .keypair
                .clone()
                .unwrap_or_else(|| self.inner.keypair.clone()),
            local_class: class,
            bind_ip: self.host(),
            fast_open: options.fast_open.unwrap_or(self.inner.options.fast_open),
            cancel: self.inner.cancel_rx.clone(),
            holepunch_hook: options.holepunch.clone(),
        };
        spawn_connect(ctx, remote_public_key)
    }

    /// Shut the node down: close every server, cancel punches, detach from
    /// the network. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let servers = std::mem::take(&mut *self.inner.servers.lock().await);
        for closer in servers {
            closer.close().await;
        }
        let _ = self.inner.cancel_tx.send(true);
        self.inner.rpc.close().await;
        debug!(node = %self.local_addr(), "node destroyed");
    }

    // ========================================================================
    // Record operations
    // ========================================================================

    /// Signed versioned put under `hash(keypair.publicKey)`. Sequence
    /// conflicts come back as [`ErrorCode`] values inside the error chain.
    pub async fn mutable_put(&self, keypair: &Keypair, seq: u64, value: &[u8]) -> Result<Target> {
        let target = crypto::hash(&keypair.public_key_bytes());
        let body = encode(&MutableSignable {
            seq,
            value: value.to_vec(),
        })?;
        let signature = keypair.sign(&crypto::mutable_signable(&body));
        let put = MutablePut {
            public_key: keypair.public_key_bytes(),
            seq,
            value: value.to_vec(),
            signature: signature.to_vec(),
        };
        let bytes = encode(&put)?;

        let mut stored = 0usize;
        let mut conflict: Option<ErrorCode> = None;
        let mut replies = self.inner.rpc.query(Command::Lookup, target, None).await;
        while let Some(reply) = replies.recv().await {
            match self
                .inner
                .rpc
                .request(
                    reply.from,
                    Command::MutablePut,
                    target,
                    Some(bytes.clone()),
                    reply.token,
                )
                .await
            {
                Ok(ack) => match ack.error {
                    Some(code) => conflict = Some(conflict.unwrap_or(code)),
                    None => stored += 1,
                },
                Err(err) => trace!(%err, "mutable put hop failed"),
            }
        }

        if let Some(code) = conflict {
            return Err(anyhow::Error::new(code));
        }
        if stored == 0 {
            return Err(anyhow!("no node stored the record"));
        }
        Ok(target)
    }

    /// Fetch the freshest mutable record with `seq` at least the given
    /// floor. Verifies the signature before returning.
    pub async fn mutable_get(
        &self,
        public_key: &Identity,
        seq: u64,
    ) -> Option<(u64, Vec<u8>)> {
        let target = crypto::hash(public_key.as_bytes());
        let want = encode(&MutableGet { seq }).ok()?;
        let mut best: Option<MutableRecord> = None;
        let mut replies = self
            .inner
            .rpc
            .query(Command::MutableGet, target, Some(want))
            .await;
        while let Some(reply) = replies.recv().await {
            let Some(value) = reply.value else { continue };
            let Ok(record) = decode_bounded::<MutableRecord>(&value) else {
                continue;
            };
            let Ok(body) = encode(&MutableSignable {
                seq: record.seq,
                value: record.value.clone(),
            }) else {
                continue;
            };
            if !public_key.verify(&crypto::mutable_signable(&body), &record.signature) {
                warn!(target = %hex::encode(&target[..8]), "mutable get: forged record skipped");
                continue;
            }
            if best.as_ref().map(|b| record.seq > b.seq).unwrap_or(true) {
                best = Some(record);
            }
        }
        best.map(|record| (record.seq, record.value))
    }

    /// Content-addressed put; returns the target the value is stored under.
    pub async fn immutable_put(&self, value: &[u8]) -> Result<Target> {
        let target = crypto::hash(value);
        let mut stored = 0usize;
        let mut replies = self.inner.rpc.query(Command::Lookup, target, None).await;
        while let Some(reply) = replies.recv().await {
            match self
                .inner
                .rpc
                .request(
                    reply.from,
                    Command::ImmutablePut,
                    target,
                    Some(value.to_vec()),
                    reply.token,
                )
                .await
            {
                Ok(_) => stored += 1,
                Err(err) => trace!(%err, "immutable put hop failed"),
            }
        }
        if stored == 0 {
            return Err(anyhow!("no node stored the value"));
        }
        Ok(target)
    }

    /// Content-addressed get; the key verifies integrity, so a forged value
    /// can never be returned.
    pub async fn immutable_get(&self, target: Target) -> Option<Vec<u8>> {
        let mut replies = self
            .inner
            .rpc
            .query(Command::ImmutableGet, target, None)
            .await;
        while let Some(reply) = replies.recv().await {
            if let Some(value) = reply.value {
                if crypto::hash(&value) == target {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Diagnostic: announce records this node holds for `target`, the
    /// router entry included.
    pub async fn announces_for(&self, target: Target) -> usize {
        self.inner.handle.announce_count(target).await
    }
}

// ============================================================================
// Node actor
// ============================================================================

struct NodeActor<R: SwarmRpc> {
    id: [u8; 32],
    rpc: R,
    store: Store,
    router: Router,
}

impl<R: SwarmRpc> NodeActor<R> {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundRequest>,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.tick().await;
        loop {
            tokio::select! {
                request = inbound.recv() => {
                    match request {
                        Some(request) => self.dispatch(request).await,
                        None => return,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NodeCommand::InstallLocal { target, record, actions, done }) => {
                            self.router.install(
                                target,
                                RouterEntry {
                                    relay: None,
                                    record,
                                    actions: Some(actions),
                                },
                            );
                            let _ = done.send(());
                        }
                        Some(NodeCommand::RemoveLocal { target, done }) => {
                            self.router.remove(&target);
                            let _ = done.send(());
                        }
                        Some(NodeCommand::AnnounceCount { target, done }) => {
                            let mut count = self.store.announce_count(&target);
                            if self.router.get(&target).is_some() {
                                count += 1;
                            }
                            let _ = done.send(count);
                        }
                        None => return,
                    }
                }
                _ = cancel_rx.changed() => return,
                _ = sweep.tick() => self.store.evict_expired(),
            }
        }
    }

    async fn dispatch(&mut self, request: InboundRequest) {
        match request.command {
            Command::Lookup => {
                let value = self.store.lookup(&request.target, &self.router);
                let _ = request.reply.send(ReplyBody {
                    value,
                    error: None,
                });
            }
            Command::FindPeer => {
                let value = self.store.find_peer(&request.target, &self.router);
                let _ = request.reply.send(ReplyBody {
                    value,
                    error: None,
                });
            }
            Command::Announce => {
                let outcome = self.store.announce(
                    &self.id,
                    request.from,
                    &request.target,
                    request.token.as_ref(),
                    request.token_ok,
                    request.value.as_deref(),
                    &mut self.router,
                );
                if let Some(body) = outcome {
                    let _ = request.reply.send(body);
                }
            }
            Command::Unannounce => {
                let outcome = self.store.unannounce(
                    &self.id,
                    &request.target,
                    request.token.as_ref(),
                    request.token_ok,
                    request.value.as_deref(),
                    &mut self.router,
                );
                if let Some(body) = outcome {
                    let _ = request.reply.send(body);
                }
            }
            Command::MutableGet => {
                let body = self
                    .store
                    .mutable_get(&request.target, request.value.as_deref())
                    .unwrap_or_else(ReplyBody::empty);
                let _ = request.reply.send(body);
            }
            Command::MutablePut => {
                let outcome = self
                    .store
                    .mutable_put(&request.target, request.value.as_deref());
                if let Some(body) = outcome {
                    let _ = request.reply.send(body);
                }
            }
            Command::ImmutableGet => {
                let body = self
                    .store
                    .immutable_get(&request.target)
                    .unwrap_or_else(ReplyBody::empty);
                let _ = request.reply.send(body);
            }
            Command::ImmutablePut => {
                let outcome = self
                    .store
                    .immutable_put(&request.target, request.value.as_deref());
                if let Some(body) = outcome {
                    let _ = request.reply.send(body);
                }
            }
            Command::Connect | Command::Holepunch => self.route(request).await,
        }
    }

    /// Resolve a connect/hole-punch request through the router: local
    /// servers get it on their action channel, announced targets get it
    /// forwarded to the node that announced to us.
    async fn route(&mut self, request: InboundRequest) {
        let Some(entry) = self.router.get(&request.target) else {
            trace!(
                target = %hex::encode(&request.target[..8]),
                "routed request dropped: unknown target"
            );
            return;
        };
        let observed = PeerAddress::from_socket_addr(request.from.addr);
        let Some(value) = request.value.as_deref() else {
            return;
        };
        let Some(value) = stamp_observed(request.command, value, observed) else {
            return;
        };

        if let Some(actions) = entry.actions.clone() {
            let action = match request.command {
                Command::Connect => match decode_bounded(&value) {
                    Ok(payload) => RouterAction::Connect {
                        from: request.from,
                        payload,
                        reply: request.reply,
                    },
                    Err(_) => return,
                },
                Command::Holepunch => match decode_bounded(&value) {
                    Ok(payload) => RouterAction::Holepunch {
                        from: request.from,
                        payload,
                        reply: request.reply,
                    },
                    Err(_) => return,
                },
                _ => return,
            };
            let _ = actions.send(action).await;
        } else if let Some(relay) = entry.relay {
            // Forward off the actor loop; the reply flows back through the
            // requester's oneshot.
            let rpc = self.rpc.clone();
            let command = request.command;
            let target = request.target;
            let reply = request.reply;
            tokio::spawn(async move {
                match rpc.request(relay, command, target, Some(value), None).await {
                    Ok(forwarded) => {
                        let _ = reply.send(ReplyBody {
                            value: forwarded.value,
                            error: forwarded.error,
                        });
                    }
                    Err(err) => {
                        trace!(%err, "relay forward failed");
                    }
                }
            });
        }
    }
}

/// Stamp the relay-observed origin address into a connect or hole-punch
/// payload, but only on the hop that first sees it: a forwarded payload
/// already carries the true client address.
fn stamp_observed(
    command: Command,
    value: &[u8],
    observed: Option<PeerAddress>,
) -> Option<Vec<u8>> {
    match command {
        Command::Connect => {
            let mut payload: crate::messages::ConnectPayload = decode_bounded(value).ok()?;
            if payload.observed.is_none() {
                payload.observed = observed;
            }
            encode(&payload).ok()
        }
        Command::Holepunch => {
            let mut outer: crate::messages::Holepunch = decode_bounded(value).ok()?;
            if let Ok(mut info) = decode_bounded::<crate::messages::PunchInfo>(&outer.payload) {
                if info.observed.is_none() {
                    info.observed = observed;
                    outer.payload = encode(&info).ok()?;
                }
            }
            encode(&outer).ok()
        }
        _ => Some(value.to_vec()),
    }
}

/// Generate (or derive from a seed) an Ed25519 keypair usable for servers
/// and connections.
pub fn keypair(seed: Option<[u8; 32]>) -> Keypair {
    match seed {
        Some(seed) => Keypair::from_seed(seed),
        None => Keypair::generate(),
    }
}
