//! Transport-agnostic framing
//!
//! The agent channel runs over whatever byte stream connects guest and
//! server: TCP, a Unix socket, or a serial device the hypervisor
//! exposes into the guest. Frames are a 4-byte big-endian length
//! followed by one CBOR envelope, identical across transports.

use std::path::Path;

use byteorder::{ByteOrder, NetworkEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};

use minimega_codec::{from_slice, to_vec, Fragment};

use crate::Error;

const HEADER_LEN: usize = 4;

/// Frames beyond this size indicate a corrupt stream
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

type Reader = Box<dyn AsyncRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// A connected but not yet framed transport
pub struct Transport {
    reader: Reader,
    writer: Writer,
}

impl Transport {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await.map_err(Error::Io)?;
        Ok(Self::from_tcp(stream))
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Transport {
            reader: Box::new(r),
            writer: Box::new(w),
        }
    }

    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, Error> {
        let stream = UnixStream::connect(path).await.map_err(Error::Io)?;
        Ok(Self::from_unix(stream))
    }

    pub fn from_unix(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Transport {
            reader: Box::new(r),
            writer: Box::new(w),
        }
    }

    /// Open a serial device (commonly a virtio-serial port inside a
    /// guest). The device is opened twice so reads and writes can
    /// proceed independently.
    pub async fn open_serial(path: impl AsRef<Path>) -> Result<Self, Error> {
        let read = tokio::fs::OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .await
            .map_err(Error::Io)?;
        let write = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path.as_ref())
            .await
            .map_err(Error::Io)?;

        Ok(Transport {
            reader: Box::new(read),
            writer: Box::new(write),
        })
    }

    /// Split into the framed halves used by reader and writer tasks
    pub fn split(self) -> (FrameReader, FrameWriter) {
        (FrameReader(self.reader), FrameWriter(self.writer))
    }
}

pub struct FrameReader(Reader);

impl FrameReader {
    pub async fn read_frame<M>(&mut self) -> Result<M, Error>
    where
        M: Fragment,
    {
        let mut header = [0u8; HEADER_LEN];
        self.0.read_exact(&mut header).await.map_err(Error::Io)?;

        let len = NetworkEndian::read_u32(&header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.0.read_exact(&mut payload).await.map_err(Error::Io)?;

        from_slice(&payload).map_err(Error::Codec)
    }
}

pub struct FrameWriter(Writer);

impl FrameWriter {
    pub async fn write_frame<M>(&mut self, msg: &M) -> Result<(), Error>
    where
        M: Fragment,
    {
        let payload = to_vec(msg).map_err(Error::Codec)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }

        let mut header = [0u8; HEADER_LEN];
        NetworkEndian::write_u32(&mut header, payload.len() as u32);

        self.0.write_all(&header).await.map_err(Error::Io)?;
        self.0.write_all(&payload).await.map_err(Error::Io)?;
        self.0.flush().await.map_err(Error::Io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_are_identical_across_transports() {
        // TCP
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, _w) = Transport::from_tcp(stream).split();
            let got: (u8, String) = r.read_frame().await.unwrap();
            got
        });

        let (_r, mut w) = Transport::connect_tcp(addr).await.unwrap().split();
        w.write_frame(&(9u8, "over tcp".to_string())).await.unwrap();
        assert_eq!(server.await.unwrap(), (9, "over tcp".to_string()));

        // Unix socket, same frames
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ron.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, _w) = Transport::from_unix(stream).split();
            let got: (u8, String) = r.read_frame().await.unwrap();
            got
        });

        let (_r, mut w) = Transport::connect_unix(&path).await.unwrap().split();
        w.write_frame(&(9u8, "over uds".to_string())).await.unwrap();
        assert_eq!(server.await.unwrap(), (9, "over uds".to_string()));
    }
}
