//! File distribution over the mesh
//!
//! Each node roots its files at a base directory. [`Iom::get`] makes a
//! named file appear locally: the file is located with an INFO
//! broadcast, split into 10 MiB parts, and each part is pulled from the
//! first responder claiming to hold it — a node with the complete file
//! or one whose own transfer already received that part. Parts land in
//! a scratch directory and the finished file moves into place with an
//! atomic rename.

pub mod protocol;
pub mod transfer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use minimega_codec::{from_slice, to_vec};
use minimega_meshage::{Envelope, Node, Tag};

pub use protocol::{Message, Reply};
pub use transfer::{Transfer, TransferStatus};

/// Mesh demux tag owned by iomeshage
pub const MESH_TAG: Tag = 2;

/// Files are split into parts of this many bytes; the last part may be
/// short
pub const PART_SIZE: u64 = 10 * 1024 * 1024;

/// Concurrent transfers per node
const QUEUE_LEN: usize = 3;

/// Attempts per part before the enclosing transfer aborts
const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default wait for INFO and WHOHAS responders
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("no mesh member has {0}")]
    NotFound(String),

    #[error("a transfer of {0} is already in flight")]
    InFlight(String),

    #[error("invalid file name: {0}")]
    BadPath(String),

    #[error("part {part} of {name} failed after retries")]
    PartFailed { name: String, part: u64 },

    #[error("short read for part {part} of {name}")]
    ShortRead { name: String, part: u64 },

    #[error("mesh send failed")]
    Mesh(#[source] minimega_meshage::Error),

    #[error("file I/O failed")]
    Io(#[source] std::io::Error),

    #[error("transfer queue closed")]
    Queue,

    #[error("{} files failed to fetch", .failed.len())]
    Incomplete {
        fetched: usize,
        failed: Vec<(String, String)>,
    },
}

enum Located {
    File { parts: u64, perm: u32 },
    Expansion(Vec<String>),
}

struct IomInner {
    node: Node,
    base: PathBuf,
    timeout: Duration,
    transfers: RwLock<HashMap<String, Transfer>>,
    tids: Mutex<HashMap<u64, mpsc::Sender<Reply>>>,
    queue: Semaphore,
}

/// The per-node file-distribution layer. Cheap to clone.
#[derive(Clone)]
pub struct Iom {
    inner: Arc<IomInner>,
}

impl Iom {
    /// Root the layer at `base`, creating it if needed, and start
    /// serving mesh requests
    pub fn new(node: Node, base: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_timeout(node, base, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        node: Node,
        base: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(Error::Io)?;

        let inner = Arc::new(IomInner {
            node,
            base,
            timeout,
            transfers: RwLock::new(HashMap::new()),
            tids: Mutex::new(HashMap::new()),
            queue: Semaphore::new(QUEUE_LEN),
        });

        tokio::spawn(IomInner::run(inner.clone()));

        Ok(Iom { inner })
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    /// Make `name` exist under the base directory, byte-identical to a
    /// copy held by some mesh member. Returns immediately when the file
    /// is already local.
    pub async fn get(&self, name: &str) -> Result<(), Error> {
        let name = clean_name(name)?;

        if self.inner.local_file(&name).await.is_some() {
            trace!(name = %name, "already local");
            return Ok(());
        }

        match self.inner.query_info(&name).await? {
            Located::File { parts, perm } => self.inner.fetch(name, parts, perm).await,
            Located::Expansion(files) => self.get_many(files).await,
        }
    }

    /// Fetch a concrete file list in shuffled order, sharing the
    /// transfer queue; per-file failures do not stop the rest
    async fn get_many(&self, mut files: Vec<String>) -> Result<(), Error> {
        files.shuffle(&mut rand::thread_rng());

        let mut tasks = tokio::task::JoinSet::new();
        for file in files {
            let iom = self.clone();
            tasks.spawn(async move {
                let res = iom.get_one(&file).await;
                (file, res)
            });
        }

        let mut fetched = 0usize;
        let mut failed: Vec<(String, String)> = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => fetched += 1,
                Ok((file, Err(err))) => failed.push((file, err.to_string())),
                Err(err) => warn!(%err, "fetch task failed"),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Incomplete { fetched, failed })
        }
    }

    /// Fetch one concrete file; expansions are not followed here
    async fn get_one(&self, name: &str) -> Result<(), Error> {
        let name = clean_name(name)?;

        if self.inner.local_file(&name).await.is_some() {
            return Ok(());
        }

        match self.inner.query_info(&name).await? {
            Located::File { parts, perm } => self.inner.fetch(name, parts, perm).await,
            Located::Expansion(_) => Err(Error::NotFound(name)),
        }
    }

    /// Snapshot of in-flight transfers
    pub fn status(&self) -> Vec<TransferStatus> {
        let transfers = self.inner.transfers.read().unwrap();
        let mut out: Vec<TransferStatus> = transfers.values().map(TransferStatus::from).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// List entries under a path relative to the base: (name, size,
    /// is_dir)
    pub async fn list(&self, rel: &str) -> Result<Vec<(String, u64, bool)>, Error> {
        let rel = if rel.is_empty() || rel == "/" {
            String::new()
        } else {
            clean_name(rel)?
        };
        let path = self.inner.base.join(&rel);

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path).await.map_err(Error::Io)?;
        while let Some(entry) = dir.next_entry().await.map_err(Error::Io)? {
            let meta = entry.metadata().await.map_err(Error::Io)?;
            entries.push((
                entry.file_name().to_string_lossy().to_string(),
                meta.len(),
                meta.is_dir(),
            ));
        }

        entries.sort();
        Ok(entries)
    }

    /// Delete a file or directory under the base
    pub async fn delete(&self, rel: &str) -> Result<(), Error> {
        let rel = clean_name(rel)?;
        let path = self.inner.base.join(&rel);

        let meta = tokio::fs::metadata(&path).await.map_err(Error::Io)?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await.map_err(Error::Io)
        } else {
            tokio::fs::remove_file(&path).await.map_err(Error::Io)
        }
    }
}

impl IomInner {
    /// Serve mesh requests and route responses; also snoop parts this
    /// node forwards for other destinations
    async fn run(inner: Arc<Self>) {
        let mut inbox = inner.node.subscribe(MESH_TAG);
        let mut snoop = inner.node.snoop(MESH_TAG);

        loop {
            select! {
                env = inbox.recv() => match env {
                    Some(env) => inner.handle(env),
                    None => break,
                },
                env = snoop.recv() => match env {
                    Some(env) => inner.handle_snoop(env).await,
                    None => break,
                },
            }
        }
    }

    fn handle(self: &Arc<Self>, env: Envelope) {
        let msg: Message = match from_slice(&env.body) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, source = %env.source, "undecodable iomeshage message");
                return;
            }
        };

        match msg {
            Message::Response { tid, mut reply } => {
                reply.from = env.source;
                let tx = self.tids.lock().unwrap().get(&tid).cloned();
                if let Some(tx) = tx {
                    // the waiter may have timed out; a refused send is fine
                    let _ = tx.try_send(reply);
                }
            }
            // requests can involve disk reads; never block the loop
            request => {
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.serve(env.source, request).await;
                });
            }
        }
    }

    async fn serve(self: &Arc<Self>, from: String, msg: Message) {
        match msg {
            Message::Info { tid, name } => {
                let Ok(name) = clean_name(&name) else { return };

                if let Some((parts, perm)) = self.local_file(&name).await {
                    let reply = Reply {
                        name,
                        ack: true,
                        parts,
                        perm,
                        ..Default::default()
                    };
                    self.respond(&from, tid, reply).await;
                } else if let Some(expansion) = self.expand(&name).await {
                    let reply = Reply {
                        name,
                        expansion,
                        ..Default::default()
                    };
                    self.respond(&from, tid, reply).await;
                }
            }
            Message::Whohas { tid, name, part } => {
                let Ok(name) = clean_name(&name) else { return };

                if self.holds_part(&name, part).await {
                    let reply = Reply {
                        name,
                        ack: true,
                        part,
                        ..Default::default()
                    };
                    self.respond(&from, tid, reply).await;
                }
            }
            Message::Xfer { tid, name, part } => {
                let Ok(name) = clean_name(&name) else { return };

                if let Some(data) = self.read_part(&name, part).await {
                    let reply = Reply {
                        name,
                        ack: true,
                        part,
                        data,
                        ..Default::default()
                    };
                    self.respond(&from, tid, reply).await;
                }
            }
            Message::Response { .. } => unreachable!("routed before serve"),
        }
    }

    /// A part observed in transit completes a local transfer that is
    /// still missing it
    async fn handle_snoop(self: &Arc<Self>, env: Envelope) {
        let Ok(Message::Response { reply, .. }) = from_slice::<Message>(&env.body) else {
            return;
        };
        if !reply.ack || reply.data.is_empty() {
            return;
        }

        let part = reply.part as usize;
        let path = {
            let transfers = self.transfers.read().unwrap();
            match transfers.get(&reply.name) {
                Some(t) if part < t.received.len() && !t.received[part] => {
                    Some(t.part_path(reply.part))
                }
                _ => None,
            }
        };
        let Some(path) = path else { return };

        debug!(name = %reply.name, part = reply.part, "completing transfer from snooped part");
        if tokio::fs::write(&path, &reply.data).await.is_ok() {
            let mut transfers = self.transfers.write().unwrap();
            if let Some(t) = transfers.get_mut(&reply.name) {
                if part < t.received.len() {
                    t.received[part] = true;
                }
            }
        }
    }

    async fn respond(self: &Arc<Self>, to: &str, tid: u64, reply: Reply) {
        let msg = Message::Response { tid, reply };
        let Ok(bytes) = to_vec(&msg) else { return };

        if let Err(err) = self.node.set(vec![to.to_string()], MESH_TAG, bytes).await {
            debug!(to = %to, %err, "response send failed");
        }
    }

    /// Part count and permissions when `name` is a complete local file
    async fn local_file(&self, name: &str) -> Option<(u64, u32)> {
        let path = self.base.join(name);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() {
            return None;
        }

        let parts = meta.len().div_ceil(PART_SIZE);
        Some((parts, mode_bits(&meta)))
    }

    /// Resolve a directory or glob into concrete file names
    async fn expand(&self, name: &str) -> Option<Vec<String>> {
        let path = self.base.join(name);

        let mut roots: Vec<PathBuf> = Vec::new();
        if matches!(tokio::fs::metadata(&path).await.map(|m| m.is_dir()), Ok(true)) {
            roots.push(path);
        } else if name.contains('*') {
            let base = self.base.clone();
            let files = self.walk(&base).await;
            let matched: Vec<String> = files
                .into_iter()
                .filter(|f| glob_match(name, f))
                .collect();
            if matched.is_empty() {
                return None;
            }
            return Some(matched);
        } else {
            return None;
        }

        let mut out = Vec::new();
        for root in roots {
            out.extend(self.walk(&root).await);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Recursively list files under `root`, as paths relative to the
    /// base; scratch directories are not shared
    async fn walk(&self, root: &Path) -> Vec<String> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };

                if meta.is_dir() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.starts_with("transfer_") {
                        stack.push(path);
                    }
                } else if meta.is_file() {
                    if let Ok(rel) = path.strip_prefix(&self.base) {
                        files.push(rel.to_string_lossy().to_string());
                    }
                }
            }
        }

        files.sort();
        files
    }

    async fn holds_part(&self, name: &str, part: u64) -> bool {
        if let Some((parts, _)) = self.local_file(name).await {
            if part < parts || parts == 0 && part == 0 {
                return true;
            }
        }

        let transfers = self.transfers.read().unwrap();
        transfers
            .get(name)
            .map(|t| {
                (part as usize) < t.received.len() && t.received[part as usize]
            })
            .unwrap_or(false)
    }

    /// Read one part's bytes, from the complete file or from a scratch
    /// fragment of an in-progress transfer
    async fn read_part(&self, name: &str, part: u64) -> Option<Vec<u8>> {
        if let Some((parts, _)) = self.local_file(name).await {
            if part < parts {
                let path = self.base.join(name);
                let mut file = tokio::fs::File::open(&path).await.ok()?;
                file.seek(std::io::SeekFrom::Start(part * PART_SIZE))
                    .await
                    .ok()?;

                let mut data = Vec::with_capacity(PART_SIZE as usize);
                let mut take = file.take(PART_SIZE);
                take.read_to_end(&mut data).await.ok()?;
                return Some(data);
            }
            if parts == 0 && part == 0 {
                return Some(Vec::new());
            }
        }

        let path = {
            let transfers = self.transfers.read().unwrap();
            transfers.get(name).and_then(|t| {
                if (part as usize) < t.received.len() && t.received[part as usize] {
                    Some(t.part_path(part))
                } else {
                    None
                }
            })
        }?;

        tokio::fs::read(&path).await.ok()
    }

    /// Locate `name` somewhere on the mesh
    async fn query_info(self: &Arc<Self>, name: &str) -> Result<Located, Error> {
        let (tid, mut rx, _guard) = self.register_tid();

        let msg = Message::Info {
            tid,
            name: name.to_string(),
        };
        self.broadcast(&msg).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) if reply.ack => {
                    return Ok(Located::File {
                        parts: reply.parts,
                        perm: reply.perm,
                    })
                }
                Ok(Some(reply)) if !reply.expansion.is_empty() => {
                    return Ok(Located::Expansion(reply.expansion))
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Err(Error::NotFound(name.to_string())),
            }
        }
    }

    /// Run one transfer to completion: queue slot, shuffled parts,
    /// reassembly, atomic rename
    async fn fetch(self: &Arc<Self>, name: String, parts: u64, perm: u32) -> Result<(), Error> {
        let suffix: u32 = rand::thread_rng().gen();
        let dir = self.base.join(format!("transfer_{suffix:08x}"));
        tokio::fs::create_dir_all(&dir).await.map_err(Error::Io)?;

        {
            let mut transfers = self.transfers.write().unwrap();
            if transfers.contains_key(&name) {
                drop(transfers);
                let _ = std::fs::remove_dir_all(&dir);
                return Err(Error::InFlight(name));
            }
            transfers.insert(
                name.clone(),
                Transfer::new(name.clone(), dir.clone(), parts, perm),
            );
        }

        info!(name = %name, parts, "transfer starting");
        let result = self.fetch_parts(&name, parts).await;

        // destructive cleanup happens under the write lock so part
        // reads cannot race it
        let transfer = self.transfers.write().unwrap().remove(&name);

        let result = match (result, transfer) {
            (Ok(()), Some(transfer)) => self.assemble(&transfer).await,
            (Ok(()), None) => Err(Error::NotFound(name.clone())),
            (Err(err), _) => Err(err),
        };

        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            debug!(%err, "scratch cleanup failed");
        }

        match &result {
            Ok(()) => info!(name = %name, "transfer complete"),
            Err(err) => warn!(name = %name, %err, "transfer aborted"),
        }

        result
    }

    async fn fetch_parts(self: &Arc<Self>, name: &str, parts: u64) -> Result<(), Error> {
        let _permit = self.queue.acquire().await.map_err(|_| Error::Queue)?;

        {
            let mut transfers = self.transfers.write().unwrap();
            if let Some(t) = transfers.get_mut(name) {
                t.queued = false;
            }
        }

        let mut order: Vec<u64> = (0..parts).collect();
        order.shuffle(&mut rand::thread_rng());

        for part in order {
            if self.part_received(name, part) {
                continue;
            }

            {
                let mut transfers = self.transfers.write().unwrap();
                if let Some(t) = transfers.get_mut(name) {
                    t.inflight = part as i64;
                }
            }

            self.fetch_one_part(name, part, parts).await?;
        }

        Ok(())
    }

    fn part_received(&self, name: &str, part: u64) -> bool {
        let transfers = self.transfers.read().unwrap();
        transfers
            .get(name)
            .map(|t| t.received[part as usize])
            .unwrap_or(false)
    }

    async fn fetch_one_part(
        self: &Arc<Self>,
        name: &str,
        part: u64,
        parts: u64,
    ) -> Result<(), Error> {
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }

            // a snooped copy may have landed while we were busy
            if self.part_received(name, part) {
                return Ok(());
            }

            match self.try_part(name, part, parts).await {
                Ok(data) => {
                    let path = {
                        let transfers = self.transfers.read().unwrap();
                        transfers
                            .get(name)
                            .map(|t| t.part_path(part))
                            .ok_or_else(|| Error::NotFound(name.to_string()))?
                    };

                    let mut file = tokio::fs::File::create(&path).await.map_err(Error::Io)?;
                    file.write_all(&data).await.map_err(Error::Io)?;
                    file.flush().await.map_err(Error::Io)?;

                    let mut transfers = self.transfers.write().unwrap();
                    if let Some(t) = transfers.get_mut(name) {
                        t.received[part as usize] = true;
                    }
                    return Ok(());
                }
                Err(err) => {
                    debug!(name = %name, part, attempt, %err, "part fetch failed");
                }
            }
        }

        Err(Error::PartFailed {
            name: name.to_string(),
            part,
        })
    }

    /// One attempt at one part: find a holder, then pull the bytes
    async fn try_part(self: &Arc<Self>, name: &str, part: u64, parts: u64) -> Result<Vec<u8>, Error> {
        let holder = {
            let (tid, mut rx, _guard) = self.register_tid();
            let msg = Message::Whohas {
                tid,
                name: name.to_string(),
                part,
            };
            self.broadcast(&msg).await?;

            match timeout(self.timeout, rx.recv()).await {
                Ok(Some(reply)) if reply.ack => reply.from,
                _ => return Err(Error::NotFound(name.to_string())),
            }
        };

        trace!(name = %name, part, holder = %holder, "pulling part");

        let (tid, mut rx, _guard) = self.register_tid();
        let msg = Message::Xfer {
            tid,
            name: name.to_string(),
            part,
        };
        let bytes = to_vec(&msg).map_err(|_| Error::NotFound(name.to_string()))?;
        self.node
            .set(vec![holder], MESH_TAG, bytes)
            .await
            .map_err(Error::Mesh)?;

        let reply = match timeout(self.timeout, rx.recv()).await {
            Ok(Some(reply)) if reply.ack => reply,
            _ => return Err(Error::NotFound(name.to_string())),
        };

        // every part except the last is exactly one part long
        let short = part + 1 < parts && reply.data.len() as u64 != PART_SIZE;
        if short || (reply.data.is_empty() && parts > 0) {
            return Err(Error::ShortRead {
                name: name.to_string(),
                part,
            });
        }

        Ok(reply.data)
    }

    /// Concatenate the parts and move the file into place with its
    /// observed permissions
    async fn assemble(&self, transfer: &Transfer) -> Result<(), Error> {
        let staged = transfer.dir.join("assembled");
        let mut out = tokio::fs::File::create(&staged).await.map_err(Error::Io)?;

        for part in 0..transfer.parts {
            let data = tokio::fs::read(transfer.part_path(part))
                .await
                .map_err(Error::Io)?;
            out.write_all(&data).await.map_err(Error::Io)?;
        }
        out.flush().await.map_err(Error::Io)?;
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = std::fs::Permissions::from_mode(transfer.perm);
            tokio::fs::set_permissions(&staged, perm)
                .await
                .map_err(Error::Io)?;
        }

        let dest = self.base.join(&transfer.name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }

        tokio::fs::rename(&staged, &dest).await.map_err(Error::Io)
    }

    async fn broadcast(self: &Arc<Self>, msg: &Message) -> Result<(), Error> {
        let bytes = to_vec(msg).map_err(|_| Error::NotFound(String::new()))?;

        match self.node.broadcast(MESH_TAG, bytes).await {
            Ok(_) => Ok(()),
            // unreachable members are fine; any responder will do
            Err(minimega_meshage::Error::Partial { .. }) => Ok(()),
            Err(err) => Err(Error::Mesh(err)),
        }
    }

    fn register_tid(self: &Arc<Self>) -> (u64, mpsc::Receiver<Reply>, TidGuard) {
        // 63-bit transaction ids
        let tid = rand::thread_rng().gen::<u64>() >> 1;
        let (tx, rx) = mpsc::channel(16);
        self.tids.lock().unwrap().insert(tid, tx);

        (
            tid,
            rx,
            TidGuard {
                inner: self.clone(),
                tid,
            },
        )
    }
}

/// Unregisters a transaction id when the waiting task finishes or times
/// out
struct TidGuard {
    inner: Arc<IomInner>,
    tid: u64,
}

impl Drop for TidGuard {
    fn drop(&mut self) {
        self.inner.tids.lock().unwrap().remove(&self.tid);
    }
}

fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

/// Normalize a name relative to the base; rejects escapes
fn clean_name(name: &str) -> Result<String, Error> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::BadPath(name.to_string()));
    }

    let escapes = trimmed
        .split('/')
        .any(|piece| piece == ".." || piece == "." || piece.is_empty());
    if escapes {
        return Err(Error::BadPath(name.to_string()));
    }

    Ok(trimmed.to_string())
}

/// Minimal glob: `*` matches any run of characters
fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }

    inner(&pattern, &name)
}
