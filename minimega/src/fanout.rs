//! Fan-out command execution over the mesh
//!
//! A `mesh send` targets a host expression. The inner command's
//! canonical text travels to each resolved host, runs against that
//! host's registry, and the responses merge into one bundle: exactly
//! one response per targeted host, with unreachable or silent hosts
//! represented by error responses.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};
use minimega_codec::{from_slice, to_vec};
use minimega_meshage::{Envelope, Node};
use minimega_minicli::{Bundle, Registry, Response};

use crate::CLI_TAG;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Traffic on the CLI tag: a command for the receiver, or the
/// receiver's merged responses
#[derive(Debug, Clone)]
enum CliMessage {
    Request { tid: u64, command: String },
    Response { tid: u64, responses: Vec<Response> },
}

impl Encode<()> for CliMessage {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            CliMessage::Request { tid, command } => {
                e.array(3)?.u16(0)?;
                e.u64(*tid)?;
                e.str(command)?;
            }
            CliMessage::Response { tid, responses } => {
                // response structs always serialize; a failure here
                // degrades to an empty payload the peer rejects
                let json = serde_json::to_vec(responses).unwrap_or_default();
                e.array(3)?.u16(1)?;
                e.u64(*tid)?;
                e.bytes(&json)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for CliMessage {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => Ok(CliMessage::Request {
                tid: d.u64()?,
                command: d.str()?.to_string(),
            }),
            1 => {
                let tid = d.u64()?;
                let json = d.bytes()?;
                let responses: Vec<Response> = serde_json::from_slice(json)
                    .map_err(|_| decode::Error::message("bad fan-out response payload"))?;
                Ok(CliMessage::Response { tid, responses })
            }
            _ => Err(decode::Error::message("unknown cli message tag")),
        }
    }
}

struct FanoutInner {
    node: Node,
    registry: Arc<Registry>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Vec<Response>>>>,
    timeout: Duration,
}

/// The fan-out service: serves remote command requests against the
/// local registry and dispatches outbound fan-outs
#[derive(Clone)]
pub struct Fanout {
    inner: Arc<FanoutInner>,
}

impl Fanout {
    pub fn new(node: Node, registry: Arc<Registry>) -> Self {
        let inner = Arc::new(FanoutInner {
            node,
            registry,
            pending: Mutex::new(HashMap::new()),
            timeout: DEFAULT_TIMEOUT,
        });

        tokio::spawn(FanoutInner::run(inner.clone()));

        Fanout { inner }
    }

    /// Run `command` on each host and merge the responses: exactly one
    /// response per targeted host
    pub async fn run(&self, hosts: Vec<String>, command: &str) -> Bundle {
        if hosts.is_empty() {
            return vec![];
        }

        let tid: u64 = rand::thread_rng().gen::<u64>() >> 1;
        let (tx, mut rx) = mpsc::channel(hosts.len());
        self.inner.pending.lock().unwrap().insert(tid, tx);

        let request = CliMessage::Request {
            tid,
            command: command.to_string(),
        };
        let bytes = match to_vec(&request) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.pending.lock().unwrap().remove(&tid);
                return hosts
                    .into_iter()
                    .map(|host| Response::error(host, err.to_string()))
                    .collect();
            }
        };

        let send = self.inner.node.set(hosts.clone(), CLI_TAG, bytes).await;

        let (delivered, mut bundle): (Vec<String>, Bundle) = match send {
            Ok(delivered) => (delivered, vec![]),
            Err(minimega_meshage::Error::Partial { delivered, failed }) => {
                let errors = failed
                    .into_iter()
                    .map(|(host, reason)| Response::error(host, reason))
                    .collect();
                (delivered, errors)
            }
            Err(err) => {
                self.inner.pending.lock().unwrap().remove(&tid);
                let reason = err.to_string();
                return hosts
                    .into_iter()
                    .map(|host| Response::error(host, reason.clone()))
                    .collect();
            }
        };

        let mut waiting: HashSet<String> = delivered.into_iter().collect();
        let deadline = tokio::time::Instant::now() + self.inner.timeout;

        while !waiting.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(responses)) => {
                    if let Some(host) = responses.first().map(|r| r.host.clone()) {
                        waiting.remove(&host);
                    }
                    bundle.extend(responses);
                }
                _ => break,
            }
        }

        self.inner.pending.lock().unwrap().remove(&tid);

        for host in waiting {
            bundle.push(Response::error(host, "no response before timeout"));
        }

        bundle
    }
}

impl FanoutInner {
    async fn run(inner: Arc<Self>) {
        let mut inbox = inner.node.subscribe(CLI_TAG);

        while let Some(envelope) = inbox.recv().await {
            inner.dispatch(envelope);
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let msg: CliMessage = match from_slice(&envelope.body) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, source = %envelope.source, "undecodable cli message");
                return;
            }
        };

        match msg {
            CliMessage::Request { tid, command } => {
                debug!(source = %envelope.source, command = %command, "remote command");
                let inner = self.clone();
                tokio::spawn(async move {
                    let responses = inner.execute_local(&command).await;
                    inner.reply(&envelope.source, tid, responses).await;
                });
            }
            CliMessage::Response { tid, responses } => {
                let tx = self.pending.lock().unwrap().get(&tid).cloned();
                if let Some(tx) = tx {
                    // the fan-out may have timed out already
                    let _ = tx.try_send(responses);
                }
            }
        }
    }

    /// Run a fanned-out command against the local registry; every
    /// response reports this host
    async fn execute_local(&self, command: &str) -> Vec<Response> {
        let host = self.node.name().to_string();

        let mut rx = match self.registry.exec_string(command) {
            Ok(Some(rx)) => rx,
            Ok(None) => return vec![Response::text(host, "")],
            Err(err) => return vec![Response::error(host, err.to_string())],
        };

        let mut responses = Vec::new();
        while let Some(bundle) = rx.recv().await {
            responses.extend(bundle);
        }

        for r in responses.iter_mut() {
            if r.host.is_empty() {
                r.host = host.clone();
            }
        }

        if responses.is_empty() {
            responses.push(Response::text(host, ""));
        }

        responses
    }

    async fn reply(&self, to: &str, tid: u64, responses: Vec<Response>) {
        let msg = CliMessage::Response { tid, responses };
        let Ok(bytes) = to_vec(&msg) else { return };

        if let Err(err) = self.node.set(vec![to.to_string()], CLI_TAG, bytes).await {
            debug!(to = %to, %err, "fan-out reply failed");
        }
    }
}
