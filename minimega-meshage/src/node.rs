//! The mesh node: peering lifecycle, view maintenance, routed delivery

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::bearer::FrameBuffer;
use crate::route::shortest_path;
use crate::wire::{Body, Envelope, Message, View};
use crate::{Error, Tag};

/// Default mesh port, used when re-dialing members by name
pub const DEFAULT_PORT: u16 = 9000;

/// Default MSA rebroadcast period
pub const DEFAULT_MSA_PERIOD: Duration = Duration::from_secs(10);

/// Default handshake and ack timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on per-subscriber and per-peering queues
const INGRESS_LEN: usize = 1024;

/// How many (source, id) pairs the duplicate filter remembers
const SEEN_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Mesh name; must be unique across the mesh (hostname by default)
    pub name: String,
    /// Port peers listen on, used when dialing members by name to
    /// maintain degree
    pub port: u16,
    /// Minimum peering count the node tries to maintain
    pub degree: usize,
    /// MSA rebroadcast period; rows older than twice this are culled
    pub msa_period: Duration,
    /// Handshake and per-recipient ack timeout
    pub timeout: Duration,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: DEFAULT_PORT,
            degree: 0,
            msa_period: DEFAULT_MSA_PERIOD,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn with_msa_period(mut self, period: Duration) -> Self {
        self.msa_period = period;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// One open peering; the task owns the socket, the node owns this row
struct Peering {
    outbound: mpsc::Sender<Message>,
}

/// Remembers recently delivered (source, id) pairs so redeliveries are
/// acked but not handed to subscribers twice
struct SeenFilter {
    seen: HashSet<(String, u64)>,
    order: VecDeque<(String, u64)>,
}

impl SeenFilter {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the pair has not been observed before
    fn observe(&mut self, source: &str, id: u64) -> bool {
        let key = (source.to_string(), id);
        if !self.seen.insert(key.clone()) {
            return false;
        }

        self.order.push_back(key);
        while self.order.len() > SEEN_LEN {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }

        true
    }
}

struct ViewState {
    rows: View,
    refreshed: HashMap<String, Instant>,
}

struct NodeInner {
    name: String,
    port: u16,
    msa_period: Duration,
    timeout: Duration,
    degree: AtomicUsize,
    next_id: AtomicU64,
    clients: Mutex<HashMap<String, Peering>>,
    view: Mutex<ViewState>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    subs: Mutex<HashMap<Tag, mpsc::Sender<Envelope>>>,
    snoops: Mutex<HashMap<Tag, mpsc::Sender<Envelope>>>,
    seen: Mutex<SeenFilter>,
}

/// A mesh node. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let inner = Arc::new(NodeInner {
            name: config.name,
            port: config.port,
            msa_period: config.msa_period,
            timeout: config.timeout,
            degree: AtomicUsize::new(config.degree),
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
            view: Mutex::new(ViewState {
                rows: View::new(),
                refreshed: HashMap::new(),
            }),
            acks: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            snoops: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenFilter::new()),
        });

        tokio::spawn(NodeInner::run_beacon(inner.clone()));

        Node { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bind the mesh listener and accept peerings in the background;
    /// returns the bound address
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<std::net::SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
        let local = listener.local_addr().map_err(Error::Io)?;
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.accept_peering(stream).await {
                                debug!(%addr, %err, "inbound handshake failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "mesh accept failed");
                    }
                }
            }
        });

        Ok(local)
    }

    /// Open a peering to a remote node; returns the peer's mesh name
    pub async fn dial(&self, addr: impl ToSocketAddrs) -> Result<String, Error> {
        self.inner.clone().dial(addr).await
    }

    /// Close one peering. Neighbors observe the change via MSA.
    pub async fn hangup(&self, name: &str) -> Result<(), Error> {
        let removed = self.inner.clients.lock().unwrap().remove(name).is_some();
        if !removed {
            return Err(Error::NotConnected(name.to_string()));
        }

        // dropping the outbound sender ends the peering task, which
        // performs the view update and MSA
        Ok(())
    }

    /// Send a body to each recipient, waiting per recipient for an ack
    /// or timeout. Returns the recipients that acked.
    pub async fn set(
        &self,
        recipients: Vec<String>,
        tag: Tag,
        body: Vec<u8>,
    ) -> Result<Vec<String>, Error> {
        self.inner.clone().set(recipients, tag, body).await
    }

    /// Send a body to every known mesh member except self; returns the
    /// set addressed
    pub async fn broadcast(&self, tag: Tag, body: Vec<u8>) -> Result<Vec<String>, Error> {
        let members = self.members();
        if members.is_empty() {
            return Ok(vec![]);
        }

        self.set(members, tag, body).await
    }

    /// Incoming message bodies addressed to this node on `tag`
    pub fn subscribe(&self, tag: Tag) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(INGRESS_LEN);
        self.inner.subs.lock().unwrap().insert(tag, tx);
        rx
    }

    /// Bodies this node forwards for other destinations on `tag`;
    /// delivery is best-effort and never blocks the forwarding path
    pub fn snoop(&self, tag: Tag) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(INGRESS_LEN);
        self.inner.snoops.lock().unwrap().insert(tag, tx);
        rx
    }

    /// Snapshot of the adjacency view, own row included
    pub fn mesh(&self) -> View {
        self.inner.mesh_snapshot()
    }

    /// Known mesh members other than self, in view order
    pub fn members(&self) -> Vec<String> {
        let view = self.inner.mesh_snapshot();
        let mut members: HashSet<String> = HashSet::new();

        for (name, peers) in &view {
            if name != &self.inner.name {
                members.insert(name.clone());
            }
            for p in peers {
                if p != &self.inner.name {
                    members.insert(p.clone());
                }
            }
        }

        let mut members: Vec<String> = members.into_iter().collect();
        members.sort();
        members
    }

    pub fn degree(&self) -> usize {
        self.inner.degree.load(Ordering::Relaxed)
    }

    /// Adjust the minimum peer count; a deficit triggers dials on the
    /// next beacon tick
    pub fn set_degree(&self, degree: usize) {
        self.inner.degree.store(degree, Ordering::Relaxed);
    }

    /// Names of directly peered nodes
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.clients.lock().unwrap().keys().cloned().collect();
        peers.sort();
        peers
    }
}

impl NodeInner {
    async fn dial(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<String, Error> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .map_err(Error::Io)?;

        let mut frames = FrameBuffer::new(stream);

        let hello = Message {
            source: self.name.clone(),
            recipients: vec![],
            route: vec![],
            id: 0,
            body: Body::Handshake {
                name: self.name.clone(),
                solicited: true,
                view: self.mesh_snapshot(),
            },
        };
        frames.write_frame(&hello).await?;

        let reply: Message = timeout(self.timeout, frames.read_frame())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        let Body::Handshake {
            name,
            solicited: false,
            view,
        } = reply.body
        else {
            return Err(Error::Rejected("unexpected handshake reply".to_string()));
        };

        if name == self.name {
            return Err(Error::NameCollision(name));
        }
        if self.clients.lock().unwrap().contains_key(&name) {
            return Err(Error::AlreadyConnected(name));
        }

        let ack = Message {
            source: self.name.clone(),
            recipients: vec![name.clone()],
            route: vec![],
            id: 0,
            body: Body::Ack,
        };
        frames.write_frame(&ack).await?;

        info!(peer = %name, "peering established");
        self.register_peering(name.clone(), frames, view).await;

        Ok(name)
    }

    async fn accept_peering(self: Arc<Self>, stream: TcpStream) -> Result<(), Error> {
        let mut frames = FrameBuffer::new(stream);

        let hello: Message = timeout(self.timeout, frames.read_frame())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        let Body::Handshake {
            name,
            solicited: true,
            view,
        } = hello.body
        else {
            return Err(Error::Rejected("unexpected handshake form".to_string()));
        };

        if name == self.name {
            return Err(Error::NameCollision(name));
        }
        // an established peering wins over a reconnect collision
        if self.clients.lock().unwrap().contains_key(&name) {
            return Err(Error::AlreadyConnected(name));
        }

        let reply = Message {
            source: self.name.clone(),
            recipients: vec![name.clone()],
            route: vec![],
            id: 0,
            body: Body::Handshake {
                name: self.name.clone(),
                solicited: false,
                view: self.mesh_snapshot(),
            },
        };
        frames.write_frame(&reply).await?;

        let ack: Message = timeout(self.timeout, frames.read_frame())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        if !matches!(ack.body, Body::Ack) {
            return Err(Error::Rejected("missing handshake ack".to_string()));
        }

        info!(peer = %name, "peering accepted");
        self.register_peering(name, frames, view).await;

        Ok(())
    }

    async fn register_peering(self: &Arc<Self>, peer: String, frames: FrameBuffer, view: View) {
        {
            let mut state = self.view.lock().unwrap();
            let now = Instant::now();
            for (origin, peers) in view {
                if origin == self.name {
                    continue;
                }
                state.refreshed.insert(origin.clone(), now);
                state.rows.insert(origin, peers);
            }
        }

        let (tx, rx) = mpsc::channel(INGRESS_LEN);
        self.clients
            .lock()
            .unwrap()
            .insert(peer.clone(), Peering { outbound: tx });

        tokio::spawn(Self::run_peering(self.clone(), peer, frames, rx));

        self.announce().await;
    }

    /// Per-peering task: one reader, one writer, multiplexed
    async fn run_peering(
        inner: Arc<Self>,
        peer: String,
        mut frames: FrameBuffer,
        mut rx: mpsc::Receiver<Message>,
    ) {
        loop {
            select! {
                res = frames.read_frame::<Message>() => match res {
                    Ok(msg) => inner.receive(msg).await,
                    Err(err) => {
                        debug!(peer = %peer, %err, "peering read failed");
                        break;
                    }
                },
                out = rx.recv() => match out {
                    Some(msg) => {
                        if let Err(err) = frames.write_frame(&msg).await {
                            debug!(peer = %peer, %err, "peering write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        inner.drop_peering(&peer).await;
    }

    async fn receive(self: &Arc<Self>, msg: Message) {
        if msg.route.is_empty() || msg.is_final_hop(&self.name) {
            self.deliver(msg).await;
            return;
        }

        match msg.next_hop(&self.name).map(str::to_string) {
            Some(next) => {
                if let Body::Msg { tag, bytes } = &msg.body {
                    self.snoop_forwarded(*tag, &msg.source, bytes);
                }

                trace!(next = %next, id = msg.id, "forwarding");
                if let Err(err) = self.send_via(&next, msg).await {
                    debug!(%err, "dropping unforwardable message");
                }
            }
            None => {
                warn!(source = %msg.source, id = msg.id, "message routed past this node");
            }
        }
    }

    async fn deliver(self: &Arc<Self>, msg: Message) {
        match &msg.body {
            Body::Msa { origin, peers } => {
                if origin != &self.name {
                    let mut state = self.view.lock().unwrap();
                    state.refreshed.insert(origin.clone(), Instant::now());
                    state
                        .rows
                        .insert(origin.clone(), peers.iter().cloned().collect());
                }
                self.send_ack(&msg).await;
            }
            Body::Ack => {
                // the registering task may have timed out and gone away;
                // a missing entry is not an error
                if let Some(tx) = self.acks.lock().unwrap().remove(&msg.id) {
                    let _ = tx.send(());
                }
            }
            Body::Msg { tag, bytes } => {
                let fresh = self.seen.lock().unwrap().observe(&msg.source, msg.id);

                if fresh {
                    let sub = self.subs.lock().unwrap().get(tag).cloned();
                    if let Some(sub) = sub {
                        let envelope = Envelope {
                            source: msg.source.clone(),
                            body: bytes.clone(),
                        };
                        if sub.send(envelope).await.is_err() {
                            debug!(tag, "subscriber gone; message dropped");
                        }
                    } else {
                        debug!(tag, "no subscriber for tag; message dropped");
                    }
                }

                self.send_ack(&msg).await;
            }
            Body::Handshake { .. } => {
                warn!(source = %msg.source, "handshake on established peering");
            }
        }
    }

    /// Ack back along the reverse of the carried route
    async fn send_ack(self: &Arc<Self>, msg: &Message) {
        if msg.route.len() < 2 {
            return;
        }

        let mut route: Vec<String> = msg.route.clone();
        route.reverse();

        let ack = Message {
            source: self.name.clone(),
            recipients: vec![msg.source.clone()],
            route,
            id: msg.id,
            body: Body::Ack,
        };

        if let Err(err) = self.send_routed(ack).await {
            debug!(%err, "ack send failed");
        }
    }

    fn snoop_forwarded(&self, tag: Tag, source: &str, bytes: &[u8]) {
        let snoop = self.snoops.lock().unwrap().get(&tag).cloned();
        if let Some(snoop) = snoop {
            let envelope = Envelope {
                source: source.to_string(),
                body: bytes.to_vec(),
            };
            // opportunistic: never block the forwarding path
            let _ = snoop.try_send(envelope);
        }
    }

    async fn send_routed(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        let next = msg
            .next_hop(&self.name)
            .map(str::to_string)
            .ok_or_else(|| Error::NoRoute(msg.recipients.join(",")))?;

        self.send_via(&next, msg).await
    }

    async fn send_via(self: &Arc<Self>, next: &str, msg: Message) -> Result<(), Error> {
        let outbound = self
            .clients
            .lock()
            .unwrap()
            .get(next)
            .map(|p| p.outbound.clone());

        match outbound {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| Error::NotConnected(next.to_string())),
            None => Err(Error::NotConnected(next.to_string())),
        }
    }

    async fn set(
        self: Arc<Self>,
        recipients: Vec<String>,
        tag: Tag,
        body: Vec<u8>,
    ) -> Result<Vec<String>, Error> {
        // routes are computed up front so a missing destination fails
        // before anything is sent
        let routes: Vec<(String, Option<Vec<String>>)> = {
            let view = self.mesh_snapshot();
            recipients
                .iter()
                .map(|r| (r.clone(), shortest_path(&view, &self.name, r)))
                .collect()
        };

        let mut delivered = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut tasks = tokio::task::JoinSet::new();

        for (recipient, path) in routes {
            match path {
                None => failed.push((recipient.clone(), Error::NoRoute(recipient).to_string())),
                Some(path) if path.len() == 1 => {
                    // addressed to self: hand straight to the subscriber
                    self.deliver_local(tag, &body).await;
                    delivered.push(recipient);
                }
                Some(path) => {
                    let inner = self.clone();
                    let body = body.clone();
                    tasks.spawn(async move {
                        let res = inner.send_and_wait(&recipient, path, tag, body).await;
                        (recipient, res)
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((recipient, Ok(()))) => delivered.push(recipient),
                Ok((recipient, Err(err))) => failed.push((recipient, err.to_string())),
                Err(err) => warn!(%err, "set task failed"),
            }
        }

        if failed.is_empty() {
            Ok(delivered)
        } else {
            Err(Error::Partial { delivered, failed })
        }
    }

    async fn deliver_local(self: &Arc<Self>, tag: Tag, body: &[u8]) {
        let sub = self.subs.lock().unwrap().get(&tag).cloned();
        if let Some(sub) = sub {
            let envelope = Envelope {
                source: self.name.clone(),
                body: body.to_vec(),
            };
            let _ = sub.send(envelope).await;
        }
    }

    async fn send_and_wait(
        self: &Arc<Self>,
        recipient: &str,
        route: Vec<String>,
        tag: Tag,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().insert(id, tx);

        let msg = Message {
            source: self.name.clone(),
            recipients: vec![recipient.to_string()],
            route,
            id,
            body: Body::Msg { tag, bytes: body },
        };

        if let Err(err) = self.send_routed(msg).await {
            self.acks.lock().unwrap().remove(&id);
            return Err(err);
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.acks.lock().unwrap().remove(&id);
                Err(Error::AckTimeout(recipient.to_string()))
            }
        }
    }

    async fn drop_peering(self: &Arc<Self>, peer: &str) {
        self.clients.lock().unwrap().remove(peer);

        {
            // forget the lost peer's row; a live peer re-announces it
            let mut state = self.view.lock().unwrap();
            state.rows.remove(peer);
            state.refreshed.remove(peer);
        }

        info!(peer = %peer, "peering closed");
        self.announce().await;
    }

    /// Broadcast our own adjacency row to every known member
    async fn announce(self: &Arc<Self>) {
        let peers: Vec<String> = {
            let mut peers: Vec<String> = self.clients.lock().unwrap().keys().cloned().collect();
            peers.sort();
            peers
        };

        let view = self.mesh_snapshot();
        let members: Vec<String> = view
            .keys()
            .filter(|name| *name != &self.name)
            .cloned()
            .collect();

        for member in members {
            let Some(route) = shortest_path(&view, &self.name, &member) else {
                continue;
            };
            if route.len() < 2 {
                continue;
            }

            let msg = Message {
                source: self.name.clone(),
                recipients: vec![member.clone()],
                route,
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                body: Body::Msa {
                    origin: self.name.clone(),
                    peers: peers.clone(),
                },
            };

            if let Err(err) = self.send_routed(msg).await {
                trace!(member = %member, %err, "msa send failed");
            }
        }
    }

    fn mesh_snapshot(&self) -> View {
        let mut view = self.view.lock().unwrap().rows.clone();
        let own: std::collections::BTreeSet<String> =
            self.clients.lock().unwrap().keys().cloned().collect();
        view.insert(self.name.clone(), own);
        view
    }

    /// Periodic beacon: rebroadcast our row, cull stale rows, repair a
    /// degree deficit
    async fn run_beacon(inner: Arc<Self>) {
        let mut ticks = tokio::time::interval(inner.msa_period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            inner.cull();
            inner.announce().await;
            inner.clone().maintain_degree().await;
        }
    }

    /// Drop rows not refreshed within twice the MSA period, except rows
    /// of direct peers
    fn cull(&self) {
        let horizon = 2 * self.msa_period;
        let clients = self.clients.lock().unwrap();
        let mut state = self.view.lock().unwrap();

        let stale: Vec<String> = state
            .rows
            .keys()
            .filter(|name| {
                *name != &self.name
                    && !clients.contains_key(*name)
                    && state
                        .refreshed
                        .get(*name)
                        .map(|at| at.elapsed() > horizon)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();

        for name in stale {
            debug!(row = %name, "culling stale adjacency row");
            state.rows.remove(&name);
            state.refreshed.remove(&name);
        }
    }

    /// Dial randomly chosen unreached members until the degree floor is
    /// met
    async fn maintain_degree(self: Arc<Self>) {
        let want = self.degree.load(Ordering::Relaxed);

        loop {
            let have = self.clients.lock().unwrap().len();
            if have >= want {
                return;
            }

            let candidate = {
                let connected = self.clients.lock().unwrap();
                let view = self.view.lock().unwrap();
                let mut candidates: Vec<String> = view
                    .rows
                    .keys()
                    .filter(|name| *name != &self.name && !connected.contains_key(*name))
                    .cloned()
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.into_iter().next()
            };

            let Some(candidate) = candidate else { return };

            let addr = format!("{}:{}", candidate, self.port);
            debug!(peer = %candidate, "dialing to maintain degree");
            if let Err(err) = self.clone().dial(addr).await {
                debug!(peer = %candidate, %err, "degree dial failed");
                return;
            }
        }
    }
}
