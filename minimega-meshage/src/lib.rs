//! Mesh overlay for the minimega control plane
//!
//! Every daemon embeds a [`Node`]. Nodes peer over TCP, exchange
//! adjacency rows (MSA), and route messages along shortest paths
//! computed from the local view. Upper layers subscribe to a numeric
//! tag and receive the opaque bodies addressed to it, mirroring how a
//! protocol multiplexer demuxes segments by protocol number.

pub mod bearer;
pub mod node;
pub mod route;
pub mod wire;

use thiserror::Error;

pub use node::{Config, Node};
pub use wire::{Envelope, View};

/// Demux key for message bodies; each subsystem owns one
pub type Tag = u16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("peering I/O error")]
    Io(#[source] tokio::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("wire codec failure")]
    Codec(#[source] minimega_codec::Error),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("mesh name collision on {0}")]
    NameCollision(String),

    #[error("already peered with {0}")]
    AlreadyConnected(String),

    #[error("no open peering with {0}")]
    NotConnected(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("no ack from {0} before timeout")]
    AckTimeout(String),

    #[error("delivery failed for {} recipients", .failed.len())]
    Partial {
        delivered: Vec<String>,
        failed: Vec<(String, String)>,
    },
}
