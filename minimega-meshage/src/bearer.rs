//! Length-prefixed framing over a mesh peering
//!
//! Each frame is a 4-byte big-endian length followed by one CBOR-encoded
//! [`Message`](crate::wire::Message). Reads are cancel-safe: partial
//! frames accumulate in the buffer across `select!` cancellations.

use byteorder::{ByteOrder, NetworkEndian};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use minimega_codec::{from_slice, to_vec, Fragment};

use crate::Error;

const HEADER_LEN: usize = 4;

/// Frames larger than this abort the peering; the largest legitimate
/// frame is a 10 MiB file part plus envelope overhead.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const BUFFER_LEN: usize = 1024 * 10;

pub struct FrameBuffer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(BUFFER_LEN),
        }
    }

    /// Cancel-safe loop that reads from the stream until `required` bytes
    /// are buffered
    async fn cancellable_read(&mut self, required: usize) -> Result<(), Error> {
        loop {
            if self.buf.len() >= required {
                break Ok(());
            }

            self.stream.readable().await.map_err(Error::Io)?;

            let remaining = required - self.buf.len();
            let mut chunk = vec![0u8; remaining];

            match self.stream.try_read(&mut chunk) {
                Ok(0) => break Err(Error::PeerClosed),
                Ok(n) => {
                    trace!(n, "found data on peering");
                    self.buf.extend_from_slice(&chunk[0..n]);
                }
                Err(ref e) if e.kind() == tokio::io::ErrorKind::WouldBlock => continue,
                Err(e) => break Err(Error::Io(e)),
            }
        }
    }

    /// Cancel-safe read of one complete frame
    pub async fn read_frame<M>(&mut self) -> Result<M, Error>
    where
        M: Fragment,
    {
        self.cancellable_read(HEADER_LEN).await?;

        let len = NetworkEndian::read_u32(&self.buf[..HEADER_LEN]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }

        self.cancellable_read(HEADER_LEN + len).await?;

        let frame: Vec<u8> = self
            .buf
            .drain(..HEADER_LEN + len)
            .skip(HEADER_LEN)
            .collect();

        if tracing::event_enabled!(tracing::Level::TRACE) {
            trace!(data = hex::encode(&frame), "read from peering");
        }

        from_slice(&frame).map_err(Error::Codec)
    }

    pub async fn write_frame<M>(&mut self, msg: &M) -> Result<(), Error>
    where
        M: Fragment,
    {
        let payload = to_vec(msg).map_err(Error::Codec)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }

        if tracing::event_enabled!(tracing::Level::TRACE) {
            trace!(data = hex::encode(&payload), "write to peering");
        }

        let mut header = [0u8; HEADER_LEN];
        NetworkEndian::write_u32(&mut header, payload.len() as u32);

        self.stream.write_all(&header).await.map_err(Error::Io)?;
        self.stream.write_all(&payload).await.map_err(Error::Io)?;
        self.stream.flush().await.map_err(Error::Io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = FrameBuffer::new(stream);

            let first: (u8, String) = frames.read_frame().await.unwrap();
            let second: (u8, String) = frames.read_frame().await.unwrap();

            (first, second)
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut frames = FrameBuffer::new(stream);

        frames.write_frame(&(1u8, "one".to_string())).await.unwrap();
        frames.write_frame(&(2u8, "two".to_string())).await.unwrap();

        let (first, second) = server.await.unwrap();
        assert_eq!(first, (1, "one".to_string()));
        assert_eq!(second, (2, "two".to_string()));
    }
}
