//! Wire records exchanged between mesh peers
//!
//! Every frame on a peering carries one [`Message`]. The body is an
//! explicit tagged union; an unknown tag is a decode error, which the
//! peering task treats as fatal for that peering.

use std::collections::{BTreeMap, BTreeSet};

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};

/// Adjacency as seen from one vantage: name to set of peered names
pub type View = BTreeMap<String, BTreeSet<String>>;

/// A message delivered to a local subscriber
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Mesh name of the node that sent the message
    pub source: String,
    /// The opaque payload, owned by the subscribing layer's codec
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Peering setup: name and adjacency exchange. `solicited` marks the
    /// dialing side.
    Handshake {
        name: String,
        solicited: bool,
        view: View,
    },

    /// Mesh status announcement: one node's own adjacency row
    Msa { origin: String, peers: Vec<String> },

    /// End-to-end acknowledgment for the message id it carries
    Ack,

    /// Routed payload for the subscriber registered on `tag`
    Msg { tag: u16, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: String,
    pub recipients: Vec<String>,
    pub route: Vec<String>,
    pub id: u64,
    pub body: Body,
}

impl Message {
    /// The hop after `name` in the carried route, when `name` is an
    /// interior hop
    pub fn next_hop(&self, name: &str) -> Option<&str> {
        let pos = self.route.iter().position(|hop| hop == name)?;

        if pos + 1 < self.route.len() {
            Some(self.route[pos + 1].as_str())
        } else {
            None
        }
    }

    /// Whether `name` is the final element of the carried route
    pub fn is_final_hop(&self, name: &str) -> bool {
        self.route.last().map(String::as_str) == Some(name)
    }
}

impl Encode<()> for Message {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(5)?;
        e.str(&self.source)?;

        e.array(self.recipients.len() as u64)?;
        for r in &self.recipients {
            e.str(r)?;
        }

        e.array(self.route.len() as u64)?;
        for hop in &self.route {
            e.str(hop)?;
        }

        e.u64(self.id)?;
        e.encode(&self.body)?;

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Message {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        expect_array(d, 5)?;

        let source = d.str()?.to_string();
        let recipients = decode_names(d)?;
        let route = decode_names(d)?;
        let id = d.u64()?;
        let body = d.decode()?;

        Ok(Message {
            source,
            recipients,
            route,
            id,
            body,
        })
    }
}

impl Encode<()> for Body {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Body::Handshake {
                name,
                solicited,
                view,
            } => {
                e.array(4)?.u16(0)?;
                e.str(name)?;
                e.bool(*solicited)?;
                encode_view(e, view)?;
            }
            Body::Msa { origin, peers } => {
                e.array(3)?.u16(1)?;
                e.str(origin)?;
                e.array(peers.len() as u64)?;
                for p in peers {
                    e.str(p)?;
                }
            }
            Body::Ack => {
                e.array(1)?.u16(2)?;
            }
            Body::Msg { tag, bytes } => {
                e.array(3)?.u16(3)?;
                e.u16(*tag)?;
                e.bytes(bytes)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Body {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => {
                let name = d.str()?.to_string();
                let solicited = d.bool()?;
                let view = decode_view(d)?;
                Ok(Body::Handshake {
                    name,
                    solicited,
                    view,
                })
            }
            1 => {
                let origin = d.str()?.to_string();
                let peers = decode_names(d)?;
                Ok(Body::Msa { origin, peers })
            }
            2 => Ok(Body::Ack),
            3 => {
                let tag = d.u16()?;
                let bytes = d.bytes()?.to_vec();
                Ok(Body::Msg { tag, bytes })
            }
            _ => Err(decode::Error::message("unknown mesh body tag")),
        }
    }
}

fn encode_view<W: encode::Write>(
    e: &mut Encoder<W>,
    view: &View,
) -> Result<(), encode::Error<W::Error>> {
    e.map(view.len() as u64)?;
    for (name, peers) in view {
        e.str(name)?;
        e.array(peers.len() as u64)?;
        for p in peers {
            e.str(p)?;
        }
    }

    Ok(())
}

fn decode_view(d: &mut Decoder<'_>) -> Result<View, decode::Error> {
    let len = d
        .map()?
        .ok_or_else(|| decode::Error::message("indefinite view map"))?;

    let mut view = View::new();
    for _ in 0..len {
        let name = d.str()?.to_string();
        let peers = decode_names(d)?;
        view.insert(name, peers.into_iter().collect());
    }

    Ok(view)
}

fn decode_names(d: &mut Decoder<'_>) -> Result<Vec<String>, decode::Error> {
    let len = d
        .array()?
        .ok_or_else(|| decode::Error::message("indefinite name list"))?;

    let mut names = Vec::with_capacity(len as usize);
    for _ in 0..len {
        names.push(d.str()?.to_string());
    }

    Ok(names)
}

fn expect_array(d: &mut Decoder<'_>, want: u64) -> Result<(), decode::Error> {
    match d.array()? {
        Some(len) if len == want => Ok(()),
        _ => Err(decode::Error::message("unexpected mesh record shape")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minimega_codec::{from_slice, to_vec};

    fn sample_view() -> View {
        let mut view = View::new();
        view.insert("a".into(), ["b".to_string()].into());
        view.insert("b".into(), ["a".to_string(), "c".to_string()].into());
        view
    }

    #[test]
    fn message_roundtrip() {
        let msg = Message {
            source: "kn1".into(),
            recipients: vec!["kn3".into()],
            route: vec!["kn1".into(), "kn2".into(), "kn3".into()],
            id: 42,
            body: Body::Msg {
                tag: 7,
                bytes: vec![1, 2, 3],
            },
        };

        let bytes = to_vec(&msg).unwrap();
        let out: Message = from_slice(&bytes).unwrap();
        assert_eq!(msg, out);
    }

    #[test]
    fn handshake_roundtrip_carries_view() {
        let msg = Message {
            source: "a".into(),
            recipients: vec![],
            route: vec![],
            id: 0,
            body: Body::Handshake {
                name: "a".into(),
                solicited: true,
                view: sample_view(),
            },
        };

        let bytes = to_vec(&msg).unwrap();
        let out: Message = from_slice(&bytes).unwrap();
        assert_eq!(msg, out);
    }

    #[test]
    fn unknown_body_tag_is_an_error() {
        use minimega_codec::minicbor;

        let mut bytes = Vec::new();
        let mut e = minicbor::Encoder::new(&mut bytes);
        e.array(1).unwrap().u16(9).unwrap();

        let out: Result<Body, _> = minimega_codec::from_slice(&bytes);
        assert!(out.is_err());
    }

    #[test]
    fn route_hop_helpers() {
        let msg = Message {
            source: "a".into(),
            recipients: vec!["c".into()],
            route: vec!["a".into(), "b".into(), "c".into()],
            id: 1,
            body: Body::Ack,
        };

        assert_eq!(msg.next_hop("a"), Some("b"));
        assert_eq!(msg.next_hop("b"), Some("c"));
        assert_eq!(msg.next_hop("c"), None);
        assert!(msg.is_final_hop("c"));
        assert!(!msg.is_final_hop("b"));
    }
}
