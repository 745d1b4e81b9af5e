//! iomeshage wire messages
//!
//! Four message kinds travel as mesh bodies: INFO locates a file and
//! its shape, WHOHAS locates a single part, XFER ships part bytes, and
//! RESPONSE carries every reply, matched to its request by transaction
//! id.

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};

/// Reply payload carried by a RESPONSE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Responder's mesh name; filled from the envelope, not the wire
    pub from: String,
    pub name: String,
    pub ack: bool,
    pub part: u64,
    /// Part count when the name resolved to a file
    pub parts: u64,
    /// Permission bits observed on the responder's copy
    pub perm: u32,
    /// Concrete file names when the name resolved to a directory or glob
    pub expansion: Vec<String>,
    /// Part bytes for XFER replies
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Does the responder have this file, and what is its shape?
    Info { tid: u64, name: String },

    /// Does the responder hold this part, complete or in flight?
    Whohas { tid: u64, name: String, part: u64 },

    /// Ship the bytes of one part
    Xfer { tid: u64, name: String, part: u64 },

    /// Any reply, matched by transaction id
    Response { tid: u64, reply: Reply },
}

impl Message {
    pub fn tid(&self) -> u64 {
        match self {
            Message::Info { tid, .. }
            | Message::Whohas { tid, .. }
            | Message::Xfer { tid, .. }
            | Message::Response { tid, .. } => *tid,
        }
    }
}

impl Encode<()> for Message {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Message::Info { tid, name } => {
                e.array(3)?.u16(0)?;
                e.u64(*tid)?;
                e.str(name)?;
            }
            Message::Whohas { tid, name, part } => {
                e.array(4)?.u16(1)?;
                e.u64(*tid)?;
                e.str(name)?;
                e.u64(*part)?;
            }
            Message::Xfer { tid, name, part } => {
                e.array(4)?.u16(2)?;
                e.u64(*tid)?;
                e.str(name)?;
                e.u64(*part)?;
            }
            Message::Response { tid, reply } => {
                e.array(9)?.u16(3)?;
                e.u64(*tid)?;
                e.str(&reply.name)?;
                e.bool(reply.ack)?;
                e.u64(reply.part)?;
                e.u64(reply.parts)?;
                e.u32(reply.perm)?;
                e.array(reply.expansion.len() as u64)?;
                for name in &reply.expansion {
                    e.str(name)?;
                }
                e.bytes(&reply.data)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Message {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => {
                let tid = d.u64()?;
                let name = d.str()?.to_string();
                Ok(Message::Info { tid, name })
            }
            1 => {
                let tid = d.u64()?;
                let name = d.str()?.to_string();
                let part = d.u64()?;
                Ok(Message::Whohas { tid, name, part })
            }
            2 => {
                let tid = d.u64()?;
                let name = d.str()?.to_string();
                let part = d.u64()?;
                Ok(Message::Xfer { tid, name, part })
            }
            3 => {
                let tid = d.u64()?;
                let name = d.str()?.to_string();
                let ack = d.bool()?;
                let part = d.u64()?;
                let parts = d.u64()?;
                let perm = d.u32()?;

                let len = d
                    .array()?
                    .ok_or_else(|| decode::Error::message("indefinite expansion list"))?;
                let mut expansion = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    expansion.push(d.str()?.to_string());
                }

                let data = d.bytes()?.to_vec();

                Ok(Message::Response {
                    tid,
                    reply: Reply {
                        from: String::new(),
                        name,
                        ack,
                        part,
                        parts,
                        perm,
                        expansion,
                        data,
                    },
                })
            }
            _ => Err(decode::Error::message("unknown iomeshage message tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minimega_codec::{from_slice, to_vec};

    #[test]
    fn request_roundtrips() {
        for msg in [
            Message::Info {
                tid: 1,
                name: "vmlinuz".into(),
            },
            Message::Whohas {
                tid: 2,
                name: "vmlinuz".into(),
                part: 3,
            },
            Message::Xfer {
                tid: 3,
                name: "vmlinuz".into(),
                part: 0,
            },
        ] {
            let bytes = to_vec(&msg).unwrap();
            let out: Message = from_slice(&bytes).unwrap();
            assert_eq!(msg, out);
        }
    }

    #[test]
    fn response_roundtrips_with_data() {
        let msg = Message::Response {
            tid: 9,
            reply: Reply {
                from: String::new(),
                name: "blob".into(),
                ack: true,
                part: 2,
                parts: 3,
                perm: 0o644,
                expansion: vec!["a".into(), "b".into()],
                data: vec![0xde, 0xad, 0xbe, 0xef],
            },
        };

        let bytes = to_vec(&msg).unwrap();
        let out: Message = from_slice(&bytes).unwrap();
        assert_eq!(msg, out);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        use minimega_codec::minicbor;

        let mut bytes = Vec::new();
        let mut e = minicbor::Encoder::new(&mut bytes);
        e.array(2).unwrap().u16(42).unwrap().u64(0).unwrap();

        let out: Result<Message, _> = from_slice(&bytes);
        assert!(out.is_err());
    }
}
