//! Framed envelopes exchanged between agent and server
//!
//! Every frame carries one [`Envelope`]. Heartbeat frames are CLIENT
//! frames: the full session state travels on every check-in.

use std::collections::BTreeMap;

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};

use crate::filter::Filter;

/// Everything a guest reports about itself on each check-in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub version: String,
    pub ips: Vec<String>,
    pub macs: Vec<String>,
    /// Highest command id this client has processed
    pub max_command_id: u64,
    /// Responses queued since the last check-in
    pub responses: Vec<CommandResponse>,
    /// Tag updates; merged into the session on the server
    pub tags: BTreeMap<String, String>,
}

/// Output of one command execution on one guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    pub id: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
}

/// What a command asks the guest to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Run a process and report its output; `background` detaches and
    /// reports launch only
    Exec {
        argv: Vec<String>,
        env: Vec<(String, String)>,
        dir: String,
        stdin: String,
        background: bool,
    },

    /// Stage files from the server into the guest
    FilesSend(Vec<String>),

    /// Pull files out of the guest
    FilesRecv(Vec<String>),

    /// Reconfigure agent logging; an empty path keeps the current
    /// destination
    Log { level: String, path: String },

    /// Publish into, or reconfigure, a named pipe on the guest
    Pipe {
        name: String,
        mode: String,
        data: String,
    },

    /// Orderly shutdown
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: u64,
    /// A guest acts only when it matches at least one filter; an empty
    /// list matches everyone
    pub filters: Vec<Filter>,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// First frame from a connecting client
    Handshake(ClientState),

    /// Command delivery, server to client
    Command(Command),

    /// Heartbeat; identical in shape to the handshake
    Client(ClientState),

    /// An encoded tunnel frame
    Tunnel(Vec<u8>),

    /// File staging in either direction
    File { name: String, data: Vec<u8> },

    /// Pipe traffic surfaced to the server
    Pipe {
        name: String,
        mode: String,
        data: String,
    },
}

impl Encode<()> for ClientState {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(10)?;
        e.str(&self.uuid)?;
        e.str(&self.hostname)?;
        e.str(&self.arch)?;
        e.str(&self.os)?;
        e.str(&self.version)?;

        encode_strs(e, &self.ips)?;
        encode_strs(e, &self.macs)?;

        e.u64(self.max_command_id)?;

        e.array(self.responses.len() as u64)?;
        for r in &self.responses {
            e.encode(r)?;
        }

        e.map(self.tags.len() as u64)?;
        for (k, v) in &self.tags {
            e.str(k)?;
            e.str(v)?;
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for ClientState {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;

        let uuid = d.str()?.to_string();
        let hostname = d.str()?.to_string();
        let arch = d.str()?.to_string();
        let os = d.str()?.to_string();
        let version = d.str()?.to_string();

        let ips = decode_strs(d)?;
        let macs = decode_strs(d)?;

        let max_command_id = d.u64()?;

        let len = d
            .array()?
            .ok_or_else(|| decode::Error::message("indefinite response list"))?;
        let mut responses = Vec::with_capacity(len as usize);
        for _ in 0..len {
            responses.push(d.decode()?);
        }

        let len = d
            .map()?
            .ok_or_else(|| decode::Error::message("indefinite tag map"))?;
        let mut tags = BTreeMap::new();
        for _ in 0..len {
            let k = d.str()?.to_string();
            let v = d.str()?.to_string();
            tags.insert(k, v);
        }

        Ok(ClientState {
            uuid,
            hostname,
            arch,
            os,
            version,
            ips,
            macs,
            max_command_id,
            responses,
            tags,
        })
    }
}

impl Encode<()> for CommandResponse {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(4)?;
        e.u64(self.id)?;
        e.str(&self.stdout)?;
        e.str(&self.stderr)?;
        e.i32(self.exit)?;

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for CommandResponse {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;

        Ok(CommandResponse {
            id: d.u64()?,
            stdout: d.str()?.to_string(),
            stderr: d.str()?.to_string(),
            exit: d.i32()?,
        })
    }
}

impl Encode<()> for CommandKind {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            CommandKind::Exec {
                argv,
                env,
                dir,
                stdin,
                background,
            } => {
                e.array(6)?.u16(0)?;
                encode_strs(e, argv)?;
                e.map(env.len() as u64)?;
                for (k, v) in env {
                    e.str(k)?;
                    e.str(v)?;
                }
                e.str(dir)?;
                e.str(stdin)?;
                e.bool(*background)?;
            }
            CommandKind::FilesSend(paths) => {
                e.array(2)?.u16(1)?;
                encode_strs(e, paths)?;
            }
            CommandKind::FilesRecv(paths) => {
                e.array(2)?.u16(2)?;
                encode_strs(e, paths)?;
            }
            CommandKind::Log { level, path } => {
                e.array(3)?.u16(3)?;
                e.str(level)?;
                e.str(path)?;
            }
            CommandKind::Pipe { name, mode, data } => {
                e.array(4)?.u16(4)?;
                e.str(name)?;
                e.str(mode)?;
                e.str(data)?;
            }
            CommandKind::Quit => {
                e.array(1)?.u16(5)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for CommandKind {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => {
                let argv = decode_strs(d)?;

                let len = d
                    .map()?
                    .ok_or_else(|| decode::Error::message("indefinite env map"))?;
                let mut env = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let k = d.str()?.to_string();
                    let v = d.str()?.to_string();
                    env.push((k, v));
                }

                Ok(CommandKind::Exec {
                    argv,
                    env,
                    dir: d.str()?.to_string(),
                    stdin: d.str()?.to_string(),
                    background: d.bool()?,
                })
            }
            1 => Ok(CommandKind::FilesSend(decode_strs(d)?)),
            2 => Ok(CommandKind::FilesRecv(decode_strs(d)?)),
            3 => Ok(CommandKind::Log {
                level: d.str()?.to_string(),
                path: d.str()?.to_string(),
            }),
            4 => Ok(CommandKind::Pipe {
                name: d.str()?.to_string(),
                mode: d.str()?.to_string(),
                data: d.str()?.to_string(),
            }),
            5 => Ok(CommandKind::Quit),
            _ => Err(decode::Error::message("unknown command kind tag")),
        }
    }
}

impl Encode<()> for Command {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(3)?;
        e.u64(self.id)?;

        e.array(self.filters.len() as u64)?;
        for f in &self.filters {
            e.encode(f)?;
        }

        e.encode(&self.kind)?;

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Command {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;

        let id = d.u64()?;

        let len = d
            .array()?
            .ok_or_else(|| decode::Error::message("indefinite filter list"))?;
        let mut filters = Vec::with_capacity(len as usize);
        for _ in 0..len {
            filters.push(d.decode()?);
        }

        let kind = d.decode()?;

        Ok(Command { id, filters, kind })
    }
}

impl Encode<()> for Envelope {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Envelope::Handshake(state) => {
                e.array(2)?.u16(0)?;
                e.encode(state)?;
            }
            Envelope::Command(cmd) => {
                e.array(2)?.u16(1)?;
                e.encode(cmd)?;
            }
            Envelope::Client(state) => {
                e.array(2)?.u16(2)?;
                e.encode(state)?;
            }
            Envelope::Tunnel(bytes) => {
                e.array(2)?.u16(3)?;
                e.bytes(bytes)?;
            }
            Envelope::File { name, data } => {
                e.array(3)?.u16(4)?;
                e.str(name)?;
                e.bytes(data)?;
            }
            Envelope::Pipe { name, mode, data } => {
                e.array(4)?.u16(5)?;
                e.str(name)?;
                e.str(mode)?;
                e.str(data)?;
            }
        }

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Envelope {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;
        let label = d.u16()?;

        match label {
            0 => Ok(Envelope::Handshake(d.decode()?)),
            1 => Ok(Envelope::Command(d.decode()?)),
            2 => Ok(Envelope::Client(d.decode()?)),
            3 => Ok(Envelope::Tunnel(d.bytes()?.to_vec())),
            4 => Ok(Envelope::File {
                name: d.str()?.to_string(),
                data: d.bytes()?.to_vec(),
            }),
            5 => Ok(Envelope::Pipe {
                name: d.str()?.to_string(),
                mode: d.str()?.to_string(),
                data: d.str()?.to_string(),
            }),
            _ => Err(decode::Error::message("unknown envelope tag")),
        }
    }
}

fn encode_strs<W: encode::Write>(
    e: &mut Encoder<W>,
    items: &[String],
) -> Result<(), encode::Error<W::Error>> {
    e.array(items.len() as u64)?;
    for item in items {
        e.str(item)?;
    }
    Ok(())
}

fn decode_strs(d: &mut Decoder<'_>) -> Result<Vec<String>, decode::Error> {
    let len = d
        .array()?
        .ok_or_else(|| decode::Error::message("indefinite string list"))?;
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(d.str()?.to_string());
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minimega_codec::{from_slice, to_vec};

    fn sample_state() -> ClientState {
        ClientState {
            uuid: "3c0f9d04-5c61-4b8e-9f28-7d0a0f7b0c11".into(),
            hostname: "guest0".into(),
            arch: "x86_64".into(),
            os: "linux".into(),
            version: "0.1.0".into(),
            ips: vec!["10.0.0.5".into()],
            macs: vec!["52:54:00:12:34:56".into()],
            max_command_id: 4,
            responses: vec![CommandResponse {
                id: 4,
                stdout: "hi\n".into(),
                stderr: String::new(),
                exit: 0,
            }],
            tags: [("role".to_string(), "web".to_string())].into(),
        }
    }

    #[test]
    fn client_state_roundtrips() {
        let state = sample_state();
        let bytes = to_vec(&state).unwrap();
        let out: ClientState = from_slice(&bytes).unwrap();
        assert_eq!(state, out);
    }

    #[test]
    fn envelopes_roundtrip() {
        let envelopes = vec![
            Envelope::Handshake(sample_state()),
            Envelope::Client(sample_state()),
            Envelope::Command(Command {
                id: 7,
                filters: vec![Filter {
                    hostname: "guest0".into(),
                    ..Default::default()
                }],
                kind: CommandKind::Exec {
                    argv: vec!["/bin/echo".into(), "hi".into()],
                    env: vec![("PATH".into(), "/bin".into())],
                    dir: "/tmp".into(),
                    stdin: String::new(),
                    background: false,
                },
            }),
            Envelope::Tunnel(vec![1, 2, 3]),
            Envelope::File {
                name: "etc/motd".into(),
                data: b"welcome".to_vec(),
            },
            Envelope::Pipe {
                name: "events".into(),
                mode: "all".into(),
                data: "boot".into(),
            },
        ];

        for envelope in envelopes {
            let bytes = to_vec(&envelope).unwrap();
            let out: Envelope = from_slice(&bytes).unwrap();
            assert_eq!(envelope, out);
        }
    }

    #[test]
    fn command_kinds_roundtrip() {
        for kind in [
            CommandKind::FilesSend(vec!["a".into()]),
            CommandKind::FilesRecv(vec!["b".into(), "c".into()]),
            CommandKind::Log {
                level: "debug".into(),
                path: "/var/log/agent.log".into(),
            },
            CommandKind::Quit,
        ] {
            let bytes = to_vec(&kind).unwrap();
            let out: CommandKind = from_slice(&bytes).unwrap();
            assert_eq!(kind, out);
        }
    }

    #[test]
    fn unknown_envelope_tag_is_an_error() {
        use minimega_codec::minicbor;

        let mut bytes = Vec::new();
        let mut e = minicbor::Encoder::new(&mut bytes);
        e.array(1).unwrap().u16(17).unwrap();

        let out: Result<Envelope, _> = from_slice(&bytes);
        assert!(out.is_err());
    }
}
