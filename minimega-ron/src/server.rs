//! The server half of the agent channel
//!
//! One session per connected guest. The server pushes commands, absorbs
//! heartbeats, stages files, and bridges tunnel frames. Guests that go
//! silent are reaped: the session is marked inactive, its tunnels are
//! torn down, and any responses it produced are flushed to disk.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs, UnixListener};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use minimega_plumber::Plumber;
use minimega_tunnel::Tunnel;

use crate::transport::{FrameWriter, Transport};
use crate::wire::{ClientState, Command, CommandKind, CommandResponse, Envelope};
use crate::{filter, Error, Filter, CLIENT_EXPIRED};

const OUTBOUND_LEN: usize = 256;

struct Session {
    state: ClientState,
    last_checkin: Instant,
    active: bool,
    outbound: Option<mpsc::Sender<Envelope>>,
    tunnel: Option<Tunnel>,
    tunnel_in: Option<mpsc::Sender<Vec<u8>>>,
}

struct CommandEntry {
    command: Command,
    responses: HashMap<String, CommandResponse>,
}

/// Snapshot of one session for status output
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub ips: Vec<String>,
    pub macs: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub last_checkin: Duration,
    pub active: bool,
}

/// Summary of one issued command for status output
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub id: u64,
    pub kind: String,
    pub responses: usize,
}

struct ServerInner {
    base: PathBuf,
    expire: Duration,
    /// Where staged files come from and land; the daemon points this at
    /// the iomeshage base so the mesh file layer backs the staging
    files_root: Mutex<PathBuf>,
    plumber: Mutex<Option<Plumber>>,
    sessions: Mutex<HashMap<String, Session>>,
    commands: Mutex<BTreeMap<u64, CommandEntry>>,
    next_id: AtomicU64,
}

/// The per-node agent server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_expire(base, CLIENT_EXPIRED)
    }

    pub fn with_expire(base: impl Into<PathBuf>, expire: Duration) -> Result<Self, Error> {
        let base = base.into();
        std::fs::create_dir_all(base.join("responses")).map_err(Error::Io)?;
        std::fs::create_dir_all(base.join("files")).map_err(Error::Io)?;

        let files_root = base.join("files");

        let inner = Arc::new(ServerInner {
            base,
            expire,
            files_root: Mutex::new(files_root),
            plumber: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            commands: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(ServerInner::reap(inner.clone()));

        Ok(Server { inner })
    }

    /// Wire guest pipe traffic into a local pipe table
    pub fn set_plumber(&self, plumber: Plumber) {
        *self.inner.plumber.lock().unwrap() = Some(plumber);
    }

    /// Point file staging at a different root. The daemon passes the
    /// iomeshage base here, so `filesSend` serves mesh-distributed
    /// files and `filesRecv` results become mesh-distributable.
    pub fn set_files_root(&self, root: impl Into<PathBuf>) {
        *self.inner.files_root.lock().unwrap() = root.into();
    }

    /// Accept agent connections over TCP; returns the bound address
    pub async fn listen_tcp(
        &self,
        addr: impl ToSocketAddrs,
    ) -> Result<std::net::SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
        let local = listener.local_addr().map_err(Error::Io)?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.handle_session(Transport::from_tcp(stream)).await
                            {
                                debug!(%err, "agent session ended");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "agent accept failed"),
                }
            }
        });

        Ok(local)
    }

    /// Accept agent connections on a Unix socket
    pub async fn listen_unix(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(Error::Io)?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                inner.handle_session(Transport::from_unix(stream)).await
                            {
                                debug!(%err, "agent session ended");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "agent accept failed"),
                }
            }
        });

        Ok(())
    }

    /// Adopt an already-connected transport (serial ports are opened by
    /// the daemon, not accepted)
    pub fn adopt(&self, transport: Transport) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.handle_session(transport).await {
                debug!(%err, "agent session ended");
            }
        });
    }

    /// Issue a command to every matching guest. Filters are validated
    /// here; matching happens on the guest.
    pub async fn exec(&self, filters: Vec<Filter>, kind: CommandKind) -> Result<u64, Error> {
        filter::validate(&filters)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let command = Command { id, filters, kind };

        self.inner.commands.lock().unwrap().insert(
            id,
            CommandEntry {
                command: command.clone(),
                responses: HashMap::new(),
            },
        );

        let targets: Vec<mpsc::Sender<Envelope>> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| s.active)
                .filter_map(|s| s.outbound.clone())
                .collect()
        };

        info!(id, sessions = targets.len(), "issuing command");
        for outbound in targets {
            let _ = outbound.send(Envelope::Command(command.clone())).await;
        }

        Ok(id)
    }

    /// Responses collected so far for a command, sorted by guest uuid
    pub fn responses(&self, id: u64) -> Vec<(String, CommandResponse)> {
        let commands = self.inner.commands.lock().unwrap();
        let mut out: Vec<(String, CommandResponse)> = commands
            .get(&id)
            .map(|entry| {
                entry
                    .responses
                    .iter()
                    .map(|(uuid, r)| (uuid.clone(), r.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Every issued command, oldest first
    pub fn commands(&self) -> Vec<CommandStatus> {
        let commands = self.inner.commands.lock().unwrap();
        commands
            .values()
            .map(|entry| CommandStatus {
                id: entry.command.id,
                kind: kind_summary(&entry.command.kind),
                responses: entry.responses.len(),
            })
            .collect()
    }

    /// Every known session, sorted by uuid
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let sessions = self.inner.sessions.lock().unwrap();
        let mut out: Vec<SessionStatus> = sessions
            .values()
            .map(|s| SessionStatus {
                uuid: s.state.uuid.clone(),
                hostname: s.state.hostname.clone(),
                arch: s.state.arch.clone(),
                os: s.state.os.clone(),
                ips: s.state.ips.clone(),
                macs: s.state.macs.clone(),
                tags: s.state.tags.clone(),
                last_checkin: s.last_checkin.elapsed(),
                active: s.active,
            })
            .collect();
        out.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        out
    }

    /// Open a forward tunnel through a guest's channel; returns the
    /// locally bound port
    pub async fn forward(
        &self,
        uuid: &str,
        src_port: u16,
        host: &str,
        dst_port: u16,
    ) -> Result<u16, Error> {
        let tunnel = self.session_tunnel(uuid)?;
        tunnel
            .forward(src_port, host, dst_port)
            .await
            .map_err(Error::Tunnel)
    }

    /// Ask a guest to listen and proxy back to `host:dst_port` here
    pub async fn reverse(
        &self,
        uuid: &str,
        src_port: u16,
        host: &str,
        dst_port: u16,
    ) -> Result<(), Error> {
        let tunnel = self.session_tunnel(uuid)?;
        tunnel
            .reverse(src_port, host, dst_port)
            .await
            .map_err(Error::Tunnel)
    }

    fn session_tunnel(&self, uuid: &str) -> Result<Tunnel, Error> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .get(uuid)
            .and_then(|s| s.tunnel.clone())
            .ok_or_else(|| Error::NoSuchSession(uuid.to_string()))
    }
}

impl ServerInner {
    async fn handle_session(self: Arc<Self>, transport: Transport) -> Result<(), Error> {
        let (mut reader, writer) = transport.split();

        let hello: Envelope = timeout(self.expire, reader.read_frame())
            .await
            .map_err(|_| Error::Handshake("no handshake before timeout".to_string()))??;

        let state = match hello {
            Envelope::Handshake(state) | Envelope::Client(state) => state,
            _ => return Err(Error::Handshake("first frame was not a handshake".into())),
        };
        if state.uuid.is_empty() {
            return Err(Error::Handshake("client offered no uuid".into()));
        }
        let uuid = state.uuid.clone();

        info!(uuid = %uuid, hostname = %state.hostname, "agent connected");

        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_LEN);
        tokio::spawn(Self::run_writer(writer, outbound_rx));

        // tunnel frames ride the same channel wrapped in TUNNEL envelopes
        let (tun_out_tx, mut tun_out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_LEN);
        let (tun_in_tx, tun_in_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_LEN);
        let tunnel = Tunnel::new(tun_out_tx, tun_in_rx);

        let wrap = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(bytes) = tun_out_rx.recv().await {
                if wrap.send(Envelope::Tunnel(bytes)).await.is_err() {
                    break;
                }
            }
        });

        let backlog: Vec<Command> = {
            let commands = self.commands.lock().unwrap();
            commands
                .values()
                .filter(|entry| entry.command.id > state.max_command_id)
                .map(|entry| entry.command.clone())
                .collect()
        };

        self.sessions.lock().unwrap().insert(
            uuid.clone(),
            Session {
                state,
                last_checkin: Instant::now(),
                active: true,
                outbound: Some(outbound_tx.clone()),
                tunnel: Some(tunnel),
                tunnel_in: Some(tun_in_tx),
            },
        );

        for command in backlog {
            let _ = outbound_tx.send(Envelope::Command(command)).await;
        }

        let result = self.read_session(&uuid, &mut reader).await;

        // a reconnect may have replaced the session; only tear down our
        // own registration
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&uuid) {
            let ours = session
                .outbound
                .as_ref()
                .map(|o| o.same_channel(&outbound_tx))
                .unwrap_or(false);
            if ours {
                session.active = false;
                session.outbound = None;
                session.tunnel = None;
                session.tunnel_in = None;
            }
        }
        info!(uuid = %uuid, "agent disconnected");

        result
    }

    async fn read_session(
        self: &Arc<Self>,
        uuid: &str,
        reader: &mut crate::transport::FrameReader,
    ) -> Result<(), Error> {
        loop {
            let envelope: Envelope = reader.read_frame().await?;

            match envelope {
                Envelope::Client(state) => self.heartbeat(uuid, state),
                Envelope::Tunnel(bytes) => {
                    let tun = self
                        .sessions
                        .lock()
                        .unwrap()
                        .get(uuid)
                        .and_then(|s| s.tunnel_in.clone());
                    if let Some(tun) = tun {
                        let _ = tun.send(bytes).await;
                    }
                }
                // an empty FILE frame asks for the file; a full one is
                // a staged result coming back from the guest
                Envelope::File { name, data } if data.is_empty() => {
                    let outbound = self
                        .sessions
                        .lock()
                        .unwrap()
                        .get(uuid)
                        .and_then(|s| s.outbound.clone());
                    if let Some(outbound) = outbound {
                        if let Err(err) = self.serve_file(&name, outbound).await {
                            warn!(uuid = %uuid, name = %name, %err, "file staging failed");
                        }
                    }
                }
                Envelope::File { name, data } => {
                    if let Err(err) = self.stage_file(uuid, &name, &data).await {
                        warn!(uuid = %uuid, name = %name, %err, "file staging failed");
                    }
                }
                Envelope::Pipe { name, data, .. } => {
                    let plumber = self.plumber.lock().unwrap().clone();
                    if let Some(plumber) = plumber {
                        plumber.write(&name, data);
                    }
                }
                other => {
                    debug!(uuid = %uuid, ?other, "unexpected envelope from agent");
                }
            }
        }
    }

    /// Merge a heartbeat. Check-in time moves only here, after a
    /// successful decode.
    fn heartbeat(&self, uuid: &str, state: ClientState) {
        let mut commands = self.commands.lock().unwrap();
        for response in &state.responses {
            if let Some(entry) = commands.get_mut(&response.id) {
                entry.responses.insert(uuid.to_string(), response.clone());
            }
        }
        drop(commands);

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(uuid) {
            let mut tags = std::mem::take(&mut session.state.tags);
            tags.extend(state.tags.clone());

            session.state = state;
            session.state.tags = tags;
            session.state.responses.clear();
            session.last_checkin = Instant::now();
            session.active = true;
        }
    }

    /// Answer a guest's request for a staged file from the files root
    async fn serve_file(&self, name: &str, outbound: mpsc::Sender<Envelope>) -> Result<(), Error> {
        if name.split('/').any(|p| p == ".." || p.is_empty()) {
            return Err(Error::Handshake(format!("bad staged path: {name}")));
        }

        let path = self.files_root.lock().unwrap().join(name);
        let data = tokio::fs::read(&path).await.map_err(Error::Io)?;

        outbound
            .send(Envelope::File {
                name: name.to_string(),
                data,
            })
            .await
            .map_err(|_| Error::Handshake("session gone".to_string()))
    }

    /// A file pulled out of a guest lands under the files root, keyed
    /// by the guest's uuid
    async fn stage_file(&self, uuid: &str, name: &str, data: &[u8]) -> Result<(), Error> {
        if name.split('/').any(|p| p == ".." || p.is_empty()) {
            return Err(Error::Handshake(format!("bad staged path: {name}")));
        }

        let path = self.files_root.lock().unwrap().join(uuid).join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        tokio::fs::write(&path, data).await.map_err(Error::Io)
    }

    async fn run_writer(mut writer: FrameWriter, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            if let Err(err) = writer.write_frame(&envelope).await {
                debug!(%err, "agent write failed");
                break;
            }
        }
    }

    /// Mark silent sessions inactive and flush what they produced
    async fn reap(inner: Arc<Self>) {
        let mut ticks = tokio::time::interval(Duration::from_secs(1));

        loop {
            ticks.tick().await;

            let expired: Vec<String> = {
                let mut sessions = inner.sessions.lock().unwrap();
                let mut expired = Vec::new();
                for (uuid, session) in sessions.iter_mut() {
                    if session.active && session.last_checkin.elapsed() > inner.expire {
                        session.active = false;
                        session.outbound = None;
                        session.tunnel = None;
                        session.tunnel_in = None;
                        expired.push(uuid.clone());
                    }
                }
                expired
            };

            for uuid in expired {
                info!(uuid = %uuid, "reaping silent agent");
                if let Err(err) = inner.flush_responses(&uuid).await {
                    warn!(uuid = %uuid, %err, "response flush failed");
                }
            }
        }
    }

    /// Persist a reaped guest's responses under
    /// `responses/<cmdid>/<uuid>/`
    async fn flush_responses(&self, uuid: &str) -> Result<(), Error> {
        let pending: Vec<(u64, CommandResponse)> = {
            let commands = self.commands.lock().unwrap();
            commands
                .iter()
                .filter_map(|(id, entry)| entry.responses.get(uuid).map(|r| (*id, r.clone())))
                .collect()
        };

        for (id, response) in pending {
            let dir = self.base.join("responses").join(id.to_string()).join(uuid);
            tokio::fs::create_dir_all(&dir).await.map_err(Error::Io)?;
            tokio::fs::write(dir.join("stdout"), &response.stdout)
                .await
                .map_err(Error::Io)?;
            tokio::fs::write(dir.join("stderr"), &response.stderr)
                .await
                .map_err(Error::Io)?;
        }

        Ok(())
    }
}

fn kind_summary(kind: &CommandKind) -> String {
    match kind {
        CommandKind::Exec { argv, background, .. } => {
            if *background {
                format!("background {}", argv.join(" "))
            } else {
                format!("exec {}", argv.join(" "))
            }
        }
        CommandKind::FilesSend(paths) => format!("send {}", paths.join(" ")),
        CommandKind::FilesRecv(paths) => format!("recv {}", paths.join(" ")),
        CommandKind::Log { level, path } if path.is_empty() => format!("log {level}"),
        CommandKind::Log { level, path } => format!("log {level} {path}"),
        CommandKind::Pipe { name, .. } => format!("pipe {name}"),
        CommandKind::Quit => "quit".to_string(),
    }
}
