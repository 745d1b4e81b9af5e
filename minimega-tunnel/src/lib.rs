//! TCP tunnels over an arbitrary byte channel
//!
//! Either end of an agent channel can proxy TCP connections across it.
//! A forward tunnel listens locally and asks the remote side to connect
//! out; a reverse tunnel asks the remote side to do the listening.
//! Tunnel frames carry their own transaction ids, so many connections
//! share one channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};
use minimega_codec::{from_slice, to_vec};

#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel I/O error")]
    Io(#[source] tokio::io::Error),

    #[error("tunnel channel closed")]
    ChannelClosed,

    #[error("tunnel codec failure")]
    Codec(#[source] minimega_codec::Error),
}

/// One tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMsg {
    /// Ask the remote side to open a TCP connection for transaction
    /// `tid`
    Connect { tid: u32, host: String, port: u16 },

    /// Connection bytes for a transaction
    Data { tid: u32, bytes: Vec<u8> },

    /// The connection for a transaction went away
    Closed { tid: u32 },

    /// Ask the remote side to listen on `src_port` and proxy each
    /// accepted connection to `host:dst_port` back across the channel
    Forward {
        src_port: u16,
        host: String,
        dst_port: u16,
    },
}

impl Encode<()> for TunnelMsg {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            TunnelMsg::Connect { tid, host, port } => {
                e.array(4)?.u16(0)?;
                e.u32(*tid)?;
                e.str(host)?;
                e.u16(*port)?;
            }
            TunnelMsg::Data { tid, bytes } => {
                e.array(3)?.u16(1)?;
                e.u32(*tid)?;
                e.bytes(bytes)?;
            }
            TunnelMsg::Closed { tid } => {
                e.array(2)?.u16(2)?;
                e.u32(*tid)?;
            }
            TunnelMsg::Forward {
                src_port,
                host,
                dst_port,
            } => {
                e.array(4)?.u16(3)?;
                e.u16(*src_port)?;
                e.str(host)?;
                e.u16(*dst_port)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for TunnelMsg {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => Ok(TunnelMsg::Connect {
                tid: d.u32()?,
                host: d.str()?.to_string(),
                port: d.u16()?,
            }),
            1 => Ok(TunnelMsg::Data {
                tid: d.u32()?,
                bytes: d.bytes()?.to_vec(),
            }),
            2 => Ok(TunnelMsg::Closed { tid: d.u32()? }),
            3 => Ok(TunnelMsg::Forward {
                src_port: d.u16()?,
                host: d.str()?.to_string(),
                dst_port: d.u16()?,
            }),
            _ => Err(decode::Error::message("unknown tunnel message tag")),
        }
    }
}

const CONN_LEN: usize = 64;
const READ_LEN: usize = 32 * 1024;

struct TunnelInner {
    out: mpsc::Sender<Vec<u8>>,
    conns: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
    next_tid: AtomicU32,
}

/// One end of a tunnel channel. Frames travel as encoded byte vectors
/// over the provided sender/receiver pair; the carrier (an agent
/// channel in production, plain channels in tests) moves them to the
/// other end.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    pub fn new(out: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<Vec<u8>>) -> Self {
        let inner = Arc::new(TunnelInner {
            out,
            conns: Mutex::new(HashMap::new()),
            next_tid: AtomicU32::new(1),
        });

        tokio::spawn(TunnelInner::run(inner.clone(), incoming));

        Tunnel { inner }
    }

    /// Listen on `src_port` locally and proxy each accepted connection
    /// to `host:dst_port` as seen from the remote side. Returns the
    /// bound port (useful when `src_port` is 0).
    pub async fn forward(&self, src_port: u16, host: &str, dst_port: u16) -> Result<u16, Error> {
        let listener = TcpListener::bind(("127.0.0.1", src_port))
            .await
            .map_err(Error::Io)?;
        let bound = listener.local_addr().map_err(Error::Io)?.port();

        let inner = self.inner.clone();
        let host = host.to_string();

        debug!(port = bound, host = %host, dst_port, "forward tunnel listening");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let tid = inner.next_tid.fetch_add(1, Ordering::SeqCst);

                        let connect = TunnelMsg::Connect {
                            tid,
                            host: host.clone(),
                            port: dst_port,
                        };
                        if inner.send(&connect).await.is_err() {
                            break;
                        }

                        inner.clone().adopt(tid, stream);
                    }
                    Err(err) => {
                        warn!(%err, "tunnel accept failed");
                        break;
                    }
                }
            }
        });

        Ok(bound)
    }

    /// Ask the remote side to listen on `src_port` and proxy to
    /// `host:dst_port` as seen from here
    pub async fn reverse(&self, src_port: u16, host: &str, dst_port: u16) -> Result<(), Error> {
        let msg = TunnelMsg::Forward {
            src_port,
            host: host.to_string(),
            dst_port,
        };
        self.inner.send(&msg).await
    }

    /// Open transactions, for status output
    pub fn active(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }
}

impl TunnelInner {
    async fn run(inner: Arc<Self>, mut incoming: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = incoming.recv().await {
            let msg: TunnelMsg = match from_slice(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(%err, "undecodable tunnel frame");
                    continue;
                }
            };

            match msg {
                TunnelMsg::Connect { tid, host, port } => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect((host.as_str(), port)).await {
                            Ok(stream) => inner.adopt(tid, stream),
                            Err(err) => {
                                debug!(tid, host = %host, port, %err, "tunnel connect failed");
                                let _ = inner.send(&TunnelMsg::Closed { tid }).await;
                            }
                        }
                    });
                }
                TunnelMsg::Data { tid, bytes } => {
                    let conn = inner.conns.lock().unwrap().get(&tid).cloned();
                    if let Some(conn) = conn {
                        if conn.send(bytes).await.is_err() {
                            let _ = inner.send(&TunnelMsg::Closed { tid }).await;
                        }
                    } else {
                        trace!(tid, "data for unknown tunnel transaction");
                    }
                }
                TunnelMsg::Closed { tid } => {
                    inner.conns.lock().unwrap().remove(&tid);
                }
                TunnelMsg::Forward {
                    src_port,
                    host,
                    dst_port,
                } => {
                    let tunnel = Tunnel {
                        inner: inner.clone(),
                    };
                    if let Err(err) = tunnel.forward(src_port, &host, dst_port).await {
                        warn!(%err, src_port, "reverse-requested forward failed");
                    }
                }
            }
        }
    }

    /// Register a connection for `tid` and pump bytes both ways
    fn adopt(self: &Arc<Self>, tid: u32, stream: TcpStream) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CONN_LEN);
        self.conns.lock().unwrap().insert(tid, tx);

        let inner = self.clone();
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            let mut buf = vec![0u8; READ_LEN];

            loop {
                tokio::select! {
                    res = read_half.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let msg = TunnelMsg::Data {
                                tid,
                                bytes: buf[..n].to_vec(),
                            };
                            if inner.send(&msg).await.is_err() {
                                break;
                            }
                        }
                    },
                    bytes = rx.recv() => match bytes {
                        Some(bytes) => {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            inner.conns.lock().unwrap().remove(&tid);
            let _ = inner.send(&TunnelMsg::Closed { tid }).await;
        });
    }

    async fn send(&self, msg: &TunnelMsg) -> Result<(), Error> {
        let frame = to_vec(msg).map_err(Error::Codec)?;
        self.out.send(frame).await.map_err(|_| Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minimega_codec::{from_slice, to_vec};

    #[test]
    fn tunnel_messages_roundtrip() {
        for msg in [
            TunnelMsg::Connect {
                tid: 1,
                host: "10.0.0.1".into(),
                port: 22,
            },
            TunnelMsg::Data {
                tid: 2,
                bytes: vec![1, 2, 3],
            },
            TunnelMsg::Closed { tid: 3 },
            TunnelMsg::Forward {
                src_port: 8080,
                host: "10.0.0.2".into(),
                dst_port: 80,
            },
        ] {
            let bytes = to_vec(&msg).unwrap();
            let out: TunnelMsg = from_slice(&bytes).unwrap();
            assert_eq!(msg, out);
        }
    }
}
