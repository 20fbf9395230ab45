//! Byte-stream codec traits.
//!
//! A [`Decoder`] turns an accumulating byte buffer into framed items; an
//! [`Encoder`] serializes items into an output buffer. The contract is
//! incremental: `decode` returns `Ok(None)` when the buffer does not yet
//! hold a complete item, and the caller feeds more bytes as they arrive.
//!
//! The WebSocket frame codec implements both traits; protocol layers drive
//! them directly from a socket adapter's receive callback, so there is no
//! framed-transport wrapper here.

use bytes::BytesMut;

/// Decodes frames out of an accumulating byte buffer.
pub trait Decoder {
    /// The framed item produced.
    type Item;
    /// Decode error.
    type Error;

    /// Attempts to decode one item from the front of `src`.
    ///
    /// Consumed bytes must be split off `src`. Returns `Ok(None)` when more
    /// input is required; the decoder must be left in a state where the
    /// same call can be retried after more bytes are appended.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error>;
}

/// Encodes items onto the back of an output buffer.
pub trait Encoder<Item> {
    /// Encode error.
    type Error;

    /// Serializes `item`, appending to `dst`.
    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy codec: one item per newline-terminated chunk.
    struct LineCodec;

    impl Decoder for LineCodec {
        type Item = Vec<u8>;
        type Error = ();

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, ()> {
            match src.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    let line = src.split_to(idx + 1);
                    Ok(Some(line[..idx].to_vec()))
                }
                None => Ok(None),
            }
        }
    }

    #[test]
    fn incremental_decode() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"hel");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"lo\nwor");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ld\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"world".to_vec()));
        assert!(buf.is_empty());
    }
}
