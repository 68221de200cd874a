//! # Transport Frame Codec
//!
//! Length-prefixed framing for `tokio_util::codec::Framed` streams: a 4-byte
//! big-endian length, a protocol version byte, then the payload. The decoder
//! never trusts a single read — it waits until the full declared length has
//! accumulated before yielding a frame, and rejects frames beyond the
//! configured payload ceiling before reserving memory for them.

use crate::config::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{constants, CommError};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One framed unit on a stream transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }
}

/// Codec producing/consuming `Frame`s over any `AsyncRead + AsyncWrite`
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = CommError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = frame.payload.len() + 1;
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CommError::Format(constants::ERR_OVERSIZED_FRAME.into()));
        }

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u8(frame.version);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len == 0 {
            return Err(CommError::Format(constants::ERR_INVALID_FRAME.into()));
        }
        if body_len > MAX_PAYLOAD_SIZE + 1 {
            return Err(CommError::Format(constants::ERR_OVERSIZED_FRAME.into()));
        }

        if src.len() < 4 + body_len {
            // Wait for the rest; reserving up front avoids repeated growth
            src.reserve(4 + body_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let version = src[0];
        let payload = src[1..body_len].to_vec();
        src.advance(body_len);

        if version != PROTOCOL_VERSION {
            return Err(CommError::Format(format!(
                "Unsupported protocol version: {version}"
            )));
        }

        Ok(Some(Frame { version, payload }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        let frame = Frame::new(vec![1, 2, 3, 4, 5]);
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(vec![9; 64]), &mut buf).unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(PROTOCOL_VERSION);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CommError::Format(_))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(99);
        buf.put_u8(0xAA);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CommError::Format(_))
        ));
    }

    #[test]
    fn empty_payload_is_valid() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(Vec::new()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }
}
