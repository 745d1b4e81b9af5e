//! The guest-side agent
//!
//! Connects to the server over any transport, announces itself, and
//! then heartbeats on a fixed interval. Commands arrive asynchronously;
//! each is filtered against the local state, executed, and its output
//! queued for the next heartbeat.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::ToSocketAddrs;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use minimega_plumber::Plumber;
use minimega_tunnel::Tunnel;

use crate::transport::{FrameReader, FrameWriter, Transport};
use crate::wire::{ClientState, Command, CommandKind, CommandResponse, Envelope};
use crate::{filter, generate_uuid, Error, HEARTBEAT_RATE};

const OUTBOUND_LEN: usize = 256;

/// Identity and behavior of one agent instance
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub version: String,
    pub ips: Vec<String>,
    pub macs: Vec<String>,
    /// Where staged files land and relative exec paths resolve
    pub workdir: PathBuf,
    pub heartbeat: Duration,
}

impl ClientConfig {
    /// Identity sniffed from the running system where possible
    pub fn new() -> Self {
        ClientConfig {
            uuid: generate_uuid(),
            hostname: read_hostname(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ips: Vec::new(),
            macs: read_macs(),
            workdir: std::env::temp_dir(),
            heartbeat: HEARTBEAT_RATE,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    config: ClientConfig,
    outbound: mpsc::Sender<Envelope>,
    processed: AtomicU64,
    responses: Mutex<Vec<CommandResponse>>,
    tags: Mutex<BTreeMap<String, String>>,
    plumber: Plumber,
    tunnel: Tunnel,
    tunnel_in: mpsc::Sender<Vec<u8>>,
    quit: watch::Sender<bool>,
    log_handler: Mutex<Option<Arc<dyn Fn(&str, &str) + Send + Sync>>>,
}

/// A connected agent. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn dial_tcp(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self, Error> {
        let transport = Transport::connect_tcp(addr).await?;
        Ok(Self::start(transport, config))
    }

    pub async fn dial_unix(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self, Error> {
        let transport = Transport::connect_unix(path).await?;
        Ok(Self::start(transport, config))
    }

    /// Attach over a serial device such as a virtio port
    pub async fn open_serial(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self, Error> {
        let transport = Transport::open_serial(path).await?;
        Ok(Self::start(transport, config))
    }

    fn start(transport: Transport, config: ClientConfig) -> Self {
        let (reader, writer) = transport.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_LEN);

        // tunnel frames wrap into TUNNEL envelopes on the way out
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

        let inner = Arc::new(ClientInner {
            config,
            outbound: outbound_tx,
            processed: AtomicU64::new(0),
            responses: Mutex::new(Vec::new()),
            tags: Mutex::new(BTreeMap::new()),
            plumber: Plumber::new(),
            tunnel: tunnel.clone(),
            tunnel_in: tun_in_tx,
            quit: watch::channel(false).0,
            log_handler: Mutex::new(None),
        });

        tokio::spawn(ClientInner::run_writer(writer, outbound_rx));
        tokio::spawn(ClientInner::run_reader(inner.clone(), reader));
        tokio::spawn(ClientInner::run_heartbeat(inner.clone()));

        Client { inner }
    }

    pub fn uuid(&self) -> &str {
        &self.inner.config.uuid
    }

    /// Attach a tag; it travels with the next heartbeat
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .tags
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// The agent's local pipe table
    pub fn plumber(&self) -> Plumber {
        self.inner.plumber.clone()
    }

    /// Called with the requested level and destination path (empty to
    /// keep the current one) when the server reconfigures logging
    pub fn on_log(&self, handler: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.inner.log_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Listen locally and proxy connections out through the server's
    /// side of the channel; returns the bound port
    pub async fn forward(&self, src_port: u16, host: &str, dst_port: u16) -> Result<u16, Error> {
        self.inner
            .tunnel
            .forward(src_port, host, dst_port)
            .await
            .map_err(Error::Tunnel)
    }

    /// Ask the server's side to listen and proxy back to `host:dst_port`
    /// as seen from this guest
    pub async fn reverse(&self, src_port: u16, host: &str, dst_port: u16) -> Result<(), Error> {
        self.inner
            .tunnel
            .reverse(src_port, host, dst_port)
            .await
            .map_err(Error::Tunnel)
    }

    /// Resolves when the server asks this agent to quit, or after
    /// [`Client::close`]
    pub async fn wait(&self) {
        let mut quit = self.inner.quit.subscribe();
        while !*quit.borrow() {
            if quit.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop heartbeating; the server reaps the session after the expiry
    /// window
    pub fn close(&self) {
        let _ = self.inner.quit.send(true);
    }
}

impl ClientInner {
    async fn run_writer(mut writer: FrameWriter, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            if let Err(err) = writer.write_frame(&envelope).await {
                debug!(%err, "agent write failed");
                break;
            }
        }
    }

    async fn run_reader(inner: Arc<Self>, mut reader: FrameReader) {
        loop {
            match reader.read_frame::<Envelope>().await {
                Ok(Envelope::Command(command)) => inner.clone().handle_command(command),
                Ok(Envelope::Tunnel(bytes)) => {
                    let _ = inner.tunnel_in.send(bytes).await;
                }
                Ok(Envelope::File { name, data }) => {
                    if let Err(err) = inner.stage_file(&name, &data).await {
                        warn!(name = %name, %err, "staged file write failed");
                    }
                }
                Ok(other) => debug!(?other, "unexpected envelope from server"),
                Err(err) => {
                    debug!(%err, "server channel closed");
                    break;
                }
            }
        }
    }

    async fn run_heartbeat(inner: Arc<Self>) {
        // the handshake is the first check-in
        let hello = Envelope::Handshake(inner.snapshot());
        if inner.outbound.send(hello).await.is_err() {
            return;
        }

        let mut ticks = tokio::time::interval(inner.config.heartbeat);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticks.tick().await;

        let mut quit = inner.quit.subscribe();

        loop {
            select! {
                _ = ticks.tick() => {
                    let beat = Envelope::Client(inner.snapshot());
                    if inner.outbound.send(beat).await.is_err() {
                        return;
                    }
                }
                _ = quit.changed() => {
                    if *quit.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Session state plus any responses queued since the last beat
    fn snapshot(&self) -> ClientState {
        let responses = std::mem::take(&mut *self.responses.lock().unwrap());
        let tags = self.tags.lock().unwrap().clone();

        ClientState {
            uuid: self.config.uuid.clone(),
            hostname: self.config.hostname.clone(),
            arch: self.config.arch.clone(),
            os: self.config.os.clone(),
            version: self.config.version.clone(),
            ips: self.config.ips.clone(),
            macs: self.config.macs.clone(),
            max_command_id: self.processed.load(Ordering::SeqCst),
            responses,
            tags,
        }
    }

    fn handle_command(self: Arc<Self>, command: Command) {
        // at most once, across redelivery
        let seen = self.processed.fetch_max(command.id, Ordering::SeqCst);
        if command.id <= seen {
            return;
        }

        if !filter::matches(&command.filters, &self.snapshot_identity()) {
            debug!(id = command.id, "command filtered out");
            return;
        }

        tokio::spawn(async move {
            match command.kind {
                CommandKind::Exec {
                    argv,
                    env,
                    dir,
                    stdin,
                    background,
                } => {
                    self.run_exec(command.id, argv, env, dir, stdin, background)
                        .await
                }
                CommandKind::FilesRecv(paths) => self.send_files(paths).await,
                CommandKind::FilesSend(paths) => self.request_files(paths).await,
                CommandKind::Log { level, path } => {
                    info!(level = %level, path = %path, "log reconfiguration requested");
                    let handler = self.log_handler.lock().unwrap().clone();
                    if let Some(handler) = handler {
                        handler(&level, &path);
                    }
                }
                CommandKind::Pipe { name, mode, data } => {
                    if !mode.is_empty() {
                        match mode.parse() {
                            Ok(mode) => self.plumber.set_mode(&name, mode),
                            Err(err) => warn!(%err, "bad pipe mode"),
                        }
                    }
                    if !data.is_empty() {
                        self.plumber.write(&name, data.clone());
                        // surface guest pipe traffic to the server too
                        let _ = self
                            .outbound
                            .send(Envelope::Pipe { name, mode, data })
                            .await;
                    }
                }
                CommandKind::Quit => {
                    info!("quit requested");
                    let _ = self.quit.send(true);
                }
            }
        });
    }

    /// Identity without draining queued responses
    fn snapshot_identity(&self) -> ClientState {
        ClientState {
            uuid: self.config.uuid.clone(),
            hostname: self.config.hostname.clone(),
            arch: self.config.arch.clone(),
            os: self.config.os.clone(),
            version: self.config.version.clone(),
            ips: self.config.ips.clone(),
            macs: self.config.macs.clone(),
            ..Default::default()
        }
    }

    async fn run_exec(
        self: &Arc<Self>,
        id: u64,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        dir: String,
        stdin: String,
        background: bool,
    ) {
        let Some(program) = argv.first() else {
            self.push_response(CommandResponse {
                id,
                stderr: "empty argv".to_string(),
                exit: -1,
                ..Default::default()
            });
            return;
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&argv[1..]);
        cmd.envs(env);
        cmd.current_dir(if dir.is_empty() {
            self.config.workdir.clone()
        } else {
            PathBuf::from(dir)
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if stdin.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        });

        if background {
            match cmd.spawn() {
                Ok(mut child) => {
                    info!(id, program = %program, "background process launched");
                    self.push_response(CommandResponse {
                        id,
                        ..Default::default()
                    });
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                Err(err) => self.push_response(CommandResponse {
                    id,
                    stderr: err.to_string(),
                    exit: -1,
                    ..Default::default()
                }),
            }
            return;
        }

        let response = match cmd.spawn() {
            Ok(mut child) => {
                if !stdin.is_empty() {
                    if let Some(mut handle) = child.stdin.take() {
                        let _ = handle.write_all(stdin.as_bytes()).await;
                    }
                }

                match child.wait_with_output().await {
                    Ok(output) => CommandResponse {
                        id,
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                        exit: output.status.code().unwrap_or(-1),
                    },
                    Err(err) => CommandResponse {
                        id,
                        stderr: err.to_string(),
                        exit: -1,
                        ..Default::default()
                    },
                }
            }
            Err(err) => CommandResponse {
                id,
                stderr: err.to_string(),
                exit: -1,
                ..Default::default()
            },
        };

        self.push_response(response);
    }

    fn push_response(&self, response: CommandResponse) {
        self.responses.lock().unwrap().push(response);
    }

    /// Ask the server to stage each path into the guest; an empty FILE
    /// frame is the request, the server answers with the bytes
    async fn request_files(self: &Arc<Self>, paths: Vec<String>) {
        for path in paths {
            let request = Envelope::File {
                name: path,
                data: Vec::new(),
            };
            if self.outbound.send(request).await.is_err() {
                return;
            }
        }
    }

    async fn send_files(self: &Arc<Self>, paths: Vec<String>) {
        for path in paths {
            let full = self.config.workdir.join(&path);
            match tokio::fs::read(&full).await {
                Ok(data) => {
                    let _ = self
                        .outbound
                        .send(Envelope::File { name: path, data })
                        .await;
                }
                Err(err) => warn!(path = %path, %err, "files recv read failed"),
            }
        }
    }

    async fn stage_file(&self, name: &str, data: &[u8]) -> Result<(), Error> {
        if name.split('/').any(|p| p == ".." || p.is_empty()) {
            return Err(Error::Handshake(format!("bad staged path: {name}")));
        }

        let path = self.config.workdir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        tokio::fs::write(&path, data).await.map_err(Error::Io)
    }
}

fn read_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// MAC addresses from sysfs, loopback excluded
fn read_macs() -> Vec<String> {
    let mut macs = Vec::new();

    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return macs;
    };

    for entry in entries.flatten() {
        if entry.file_name() == "lo" {
            continue;
        }
        if let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) {
            let mac = mac.trim().to_string();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                macs.push(mac);
            }
        }
    }

    macs.sort();
    macs
}
