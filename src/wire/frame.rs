//! On-wire frame codec.
//!
//! Every WebSocket binary message carries exactly one frame:
//! 1 byte frame type, 8 bytes frame id, payload to end of message.
//! The frame id travels big-endian (network order) in both directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header size: type byte plus 64-bit id.
pub const FRAME_HEADER_LEN: usize = 9;

/// Frame type discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Application payload (request, response, or push).
    Data,
    /// QoS1 delivery acknowledgement.
    Ack,
    /// QoS2 phase 1: announce a pending exactly-once delivery.
    Prepare,
    /// QoS2 phase 2: peer accepted the PREPARE.
    PrepareAck,
    /// QoS2 phase 3: sender commits the delivery.
    Commit,
    /// QoS2 phase 4: peer confirms the commit.
    Complete,
    /// Forward-compat passthrough for types this build does not know.
    Unknown(u8),
}

impl FrameType {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0 => Self::Data,
            1 => Self::Ack,
            2 => Self::Prepare,
            3 => Self::PrepareAck,
            4 => Self::Commit,
            5 => Self::Complete,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Ack => 1,
            Self::Prepare => 2,
            Self::PrepareAck => 3,
            Self::Commit => 4,
            Self::Complete => 5,
            Self::Unknown(other) => other,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "DATA"),
            Self::Ack => write!(f, "ACK"),
            Self::Prepare => write!(f, "PREPARE"),
            Self::PrepareAck => write!(f, "PREPARE_ACK"),
            Self::Commit => write!(f, "COMMIT"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Unknown(b) => write!(f, "UNKNOWN({b})"),
        }
    }
}

/// Frame decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes (minimum {FRAME_HEADER_LEN})")]
    TooShort(usize),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
}

/// A decoded wire frame. The payload is a sub-slice of the received
/// message buffer; decoding allocates nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            id,
            payload: payload.into(),
        }
    }

    pub fn data(id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, id, payload)
    }

    pub fn ack(id: u64) -> Self {
        Self::new(FrameType::Ack, id, Bytes::new())
    }

    pub fn prepare(id: u64) -> Self {
        Self::new(FrameType::Prepare, id, Bytes::new())
    }

    pub fn commit(id: u64) -> Self {
        Self::new(FrameType::Commit, id, Bytes::new())
    }

    /// Encode into a single output buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type.to_wire());
        buf.put_u64(self.id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a received message. In strict mode an unknown frame type is a
    /// protocol error; otherwise it is passed through untouched so newer
    /// peers can speak to older builds.
    pub fn decode(mut raw: Bytes, strict: bool) -> Result<Self, FrameError> {
        if raw.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort(raw.len()));
        }
        let type_byte = raw.get_u8();
        let id = raw.get_u64();
        let frame_type = FrameType::from_wire(type_byte);
        if strict && !frame_type.is_known() {
            return Err(FrameError::UnknownType(type_byte));
        }
        Ok(Self {
            frame_type,
            id,
            payload: raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::data(0x0102_0304_0506_0708, Bytes::from_static(b"hi"));
        let wire = frame.encode();
        assert_eq!(wire.len(), 11);
        assert_eq!(wire[0], 0);
        // Big-endian id bytes.
        assert_eq!(&wire[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[9..], b"hi");
    }

    #[test]
    fn test_decode_roundtrip() {
        let frame = Frame::new(FrameType::PrepareAck, 42, Bytes::from_static(b"xyz"));
        let decoded = Frame::decode(frame.encode(), true).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_short_frame_rejected() {
        let err = Frame::decode(Bytes::from_static(&[0, 1, 2]), false).unwrap_err();
        assert_eq!(err, FrameError::TooShort(3));
    }

    #[test]
    fn test_empty_payload_boundary() {
        let wire = Frame::ack(7).encode();
        assert_eq!(wire.len(), FRAME_HEADER_LEN);
        let decoded = Frame::decode(wire, true).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Ack);
        assert_eq!(decoded.id, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_unknown_type_strictness() {
        let mut raw = BytesMut::new();
        raw.put_u8(99);
        raw.put_u64(1);
        raw.put_slice(b"p");
        let raw = raw.freeze();

        let err = Frame::decode(raw.clone(), true).unwrap_err();
        assert_eq!(err, FrameError::UnknownType(99));

        let passed = Frame::decode(raw, false).unwrap();
        assert_eq!(passed.frame_type, FrameType::Unknown(99));
        assert_eq!(passed.encode()[0], 99);
    }

    #[test]
    fn test_payload_is_subslice() {
        let frame = Frame::data(1, Bytes::from(vec![b'a'; 64]));
        let wire = frame.encode();
        let decoded = Frame::decode(wire.clone(), true).unwrap();
        // Zero-copy: decoded payload points into the original buffer.
        assert_eq!(
            decoded.payload.as_ptr() as usize,
            wire.as_ptr() as usize + FRAME_HEADER_LEN
        );
    }
}
