//! Length-prefixed frame codec for the channel transport.
//!
//! Wire format:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The length prefix counts payload bytes only. Frames are validated against
//! the current size limit BEFORE any allocation, so a hostile peer cannot
//! force large buffers by sending an oversized length prefix.
//!
//! A freshly created codec enforces [`MAX_UNAUTHENTICATED_FRAME_SIZE`]; after
//! the channel is authenticated both ends call [`FrameCodec::lift_frame_limit`]
//! to raise the limit to [`MAX_FRAME_SIZE`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MAX_FRAME_SIZE, MAX_UNAUTHENTICATED_FRAME_SIZE, ProtocolError};

/// Length of the frame header in bytes.
const HEADER_LEN: usize = 4;

/// Length-prefixed frame codec.
///
/// Decodes inbound byte streams into whole-frame [`Bytes`] payloads and
/// encodes outbound payloads with a 4-byte big-endian length prefix.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the unauthenticated frame limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_UNAUTHENTICATED_FRAME_SIZE,
        }
    }

    /// Create a codec with a specific frame limit (for testing).
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Raise the frame limit to [`MAX_FRAME_SIZE`].
    ///
    /// Called once the channel is authenticated.
    pub fn lift_frame_limit(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
    }

    /// Returns the current frame limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        // Validate before reserving anything.
        if len > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(len, self.max_frame_size));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }

        let len = u32::try_from(item.len()).map_err(|_| {
            ProtocolError::frame_too_large(item.len(), self.max_frame_size)
        })?;

        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(codec: &mut FrameCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(&mut codec, b"hello");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_empty_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(&mut codec, b"");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0u8][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_payload() {
        let mut codec = FrameCodec::new();
        let full = encode_frame(&mut codec, b"hello world");
        let mut buf = BytesMut::from(&full[..7]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[7..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello world");
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = encode_frame(&mut codec, b"one");
        buf.extend_from_slice(&encode_frame(&mut codec, b"two"));

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_length_prefix() {
        let mut codec = FrameCodec::new();
        // Length prefix claims a frame larger than the unauthenticated limit,
        // with no payload following. Must fail without waiting for bytes.
        let claimed = (MAX_UNAUTHENTICATED_FRAME_SIZE + 1) as u32;
        let mut buf = BytesMut::from(&claimed.to_be_bytes()[..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, max })
            if size == MAX_UNAUTHENTICATED_FRAME_SIZE + 1 && max == MAX_UNAUTHENTICATED_FRAME_SIZE
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        let result = codec.encode(Bytes::from(vec![0u8; 9]), &mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_lift_frame_limit() {
        let mut codec = FrameCodec::new();
        assert_eq!(codec.max_frame_size(), MAX_UNAUTHENTICATED_FRAME_SIZE);

        let claimed = (MAX_UNAUTHENTICATED_FRAME_SIZE + 1) as u32;
        let payload = vec![0u8; MAX_UNAUTHENTICATED_FRAME_SIZE + 1];

        codec.lift_frame_limit();
        assert_eq!(codec.max_frame_size(), MAX_FRAME_SIZE);

        let mut buf = BytesMut::from(&claimed.to_be_bytes()[..]);
        buf.extend_from_slice(&payload);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), MAX_UNAUTHENTICATED_FRAME_SIZE + 1);
    }

    #[test]
    fn test_frame_at_exact_limit_accepted() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut buf = encode_frame(&mut codec, &[0xAB; 16]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 16);
    }
}
