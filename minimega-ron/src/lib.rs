//! Agent control channel
//!
//! A server embedded in each node and a client embedded in each guest,
//! speaking length-prefixed CBOR envelopes over TCP, a Unix socket, or
//! a hypervisor-exposed serial port. The channel multiplexes command
//! delivery, heartbeats, file staging, and TCP tunnels.

pub mod client;
pub mod filter;
pub mod server;
pub mod transport;
pub mod wire;

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

pub use client::{Client, ClientConfig};
pub use filter::Filter;
pub use server::{CommandStatus, Server, SessionStatus};
pub use wire::{ClientState, Command, CommandKind, CommandResponse, Envelope};

/// How often a client checks in
pub const HEARTBEAT_RATE: Duration = Duration::from_secs(5);

/// A session with no heartbeat for this long is reaped
pub const CLIENT_EXPIRED: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel I/O error")]
    Io(#[source] tokio::io::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("wire codec failure")]
    Codec(#[source] minimega_codec::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("malformed filter: {0}")]
    BadFilter(String),

    #[error("no connected session for {0}")]
    NoSuchSession(String),

    #[error("tunnel failure")]
    Tunnel(#[source] minimega_tunnel::Error),
}

/// A UUIDv4-style client identifier
pub fn generate_uuid() -> String {
    let mut rng = rand::thread_rng();
    let a: u32 = rng.gen();
    let b: u16 = rng.gen();
    let c: u16 = (rng.gen::<u16>() & 0x0fff) | 0x4000;
    let d: u16 = (rng.gen::<u16>() & 0x3fff) | 0x8000;
    let e: u64 = rng.gen::<u64>() & 0xffff_ffff_ffff;

    format!("{a:08x}-{b:04x}-{c:04x}-{d:04x}-{e:012x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuids_look_like_v4() {
        let uuid = generate_uuid();

        let pieces: Vec<&str> = uuid.split('-').collect();
        assert_eq!(pieces.len(), 5);
        assert_eq!(pieces[0].len(), 8);
        assert_eq!(pieces[1].len(), 4);
        assert_eq!(pieces[2].len(), 4);
        assert_eq!(pieces[3].len(), 4);
        assert_eq!(pieces[4].len(), 12);
        assert!(pieces[2].starts_with('4'));

        assert_ne!(generate_uuid(), generate_uuid());
    }
}
