/// Shared re-export of the minicbor lib across all minimega crates
pub use minicbor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failure to encode wire message")]
    Encoding(String),

    #[error("failure to decode wire message")]
    Decoding(String),
}

/// A self-contained wire message that can round-trip through CBOR
pub trait Fragment: Sized + for<'b> minicbor::Decode<'b, ()> + minicbor::Encode<()> {}

impl<T> Fragment for T where T: for<'b> minicbor::Decode<'b, ()> + minicbor::Encode<()> + Sized {}

/// Encode a message into a fresh byte buffer
pub fn to_vec<M>(msg: &M) -> Result<Vec<u8>, Error>
where
    M: Fragment,
{
    let mut payload = Vec::new();
    minicbor::encode(msg, &mut payload).map_err(|err| Error::Encoding(err.to_string()))?;

    Ok(payload)
}

/// Decode a message from a byte buffer holding exactly one message
pub fn from_slice<M>(buffer: &[u8]) -> Result<M, Error>
where
    M: Fragment,
{
    minicbor::decode(buffer).map_err(|err| Error::Decoding(err.to_string()))
}

/// Attempt to decode one message from the front of a buffer, draining the
/// consumed bytes. Returns `None` when the buffer holds only a partial
/// message.
pub fn try_decode_message<M>(buffer: &mut Vec<u8>) -> Result<Option<M>, Error>
where
    M: Fragment,
{
    let mut decoder = minicbor::Decoder::new(buffer);
    let maybe_msg = decoder.decode();

    match maybe_msg {
        Ok(msg) => {
            let pos = decoder.position();
            buffer.drain(0..pos);
            Ok(Some(msg))
        }
        Err(err) if err.is_end_of_input() => Ok(None),
        Err(err) => Err(Error::Decoding(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_helpers() {
        let input = (1u8, "kn1".to_string(), vec![2u64, 3u64]);

        let payload = to_vec(&input).unwrap();
        let output: (u8, String, Vec<u64>) = from_slice(&payload).unwrap();

        assert_eq!(input, output);
    }

    #[test]
    fn partial_buffer_yields_none() {
        let input = (7u8, 8u8, 9u8);

        let payload = to_vec(&input).unwrap();
        let mut partial = Vec::from(&payload[..payload.len() - 1]);

        let out: Option<(u8, u8, u8)> = try_decode_message(&mut partial).unwrap();
        assert!(out.is_none());

        partial.push(payload[payload.len() - 1]);
        let out: Option<(u8, u8, u8)> = try_decode_message(&mut partial).unwrap();
        assert_eq!(out, Some(input));
        assert!(partial.is_empty());
    }
}
