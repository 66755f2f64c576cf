//! Session frames and their codec

use crate::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Protocol version written into every header
pub const VERSION: u8 = 0;

/// Stream id used by session-level frames (ping, go-away)
pub const SESSION_STREAM_ID: StreamId = 0;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Ping = 1,
    GoAway = 2,
    /// Grants the sender more receive window on a stream
    WindowUpdate = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Ping),
            2 => Ok(FrameType::GoAway),
            3 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// First frame of a new stream
    pub const SYN: u16 = 0b0000_0001;
    /// Ping reply
    pub const ACK: u16 = 0b0000_0010;
    /// Sender finished writing
    pub const FIN: u16 = 0b0000_0100;
    /// Stream aborted
    pub const RST: u16 = 0b0000_1000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_syn(mut self) -> Self {
        self.0 |= Self::SYN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: version (1) + type (1) + flags (2) + stream_id (4) + length (4) = 12 bytes
    pub const HEADER_SIZE: usize = 12;

    pub fn new(frame_type: FrameType, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::new(),
            stream_id,
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    /// Opens `stream_id` on the remote side
    pub fn syn(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_syn())
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    pub fn rst(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn ping(opaque: u32) -> Self {
        Self::new(
            FrameType::Ping,
            SESSION_STREAM_ID,
            Bytes::copy_from_slice(&opaque.to_be_bytes()),
        )
    }

    pub fn pong(opaque: u32) -> Self {
        Self::ping(opaque).with_flags(FrameFlags::new().with_ack())
    }

    /// Lets the peer send `delta` more bytes on `stream_id`
    pub fn window_update(stream_id: StreamId, delta: u32) -> Self {
        Self::new(
            FrameType::WindowUpdate,
            stream_id,
            Bytes::copy_from_slice(&delta.to_be_bytes()),
        )
    }

    pub fn go_away() -> Self {
        Self::new(FrameType::GoAway, SESSION_STREAM_ID, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Opaque value of a ping frame
    pub fn ping_opaque(&self) -> Option<u32> {
        self.payload_u32()
    }

    /// Window increment carried by a window update
    pub fn window_delta(&self) -> Option<u32> {
        self.payload_u32()
    }

    fn payload_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Encodes and decodes [`Frame`]s on a byte stream
#[derive(Debug, Clone)]
pub struct MuxCodec {
    max_frame_size: usize,
}

impl MuxCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if length > self.max_frame_size {
            return Err(MuxError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let version = src.get_u8();
        if version != VERSION {
            return Err(MuxError::UnsupportedVersion(version));
        }
        let frame_type = FrameType::try_from(src.get_u8())?;
        let flags = FrameFlags::from_u16(src.get_u16());
        let stream_id = src.get_u32();
        let _ = src.get_u32();
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = frame.payload.len();
        if payload_len > self.max_frame_size {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u8(VERSION);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u16(frame.flags.as_u16());
        dst.put_u32(frame.stream_id);
        dst.put_u32(payload_len as u32);
        dst.put(frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = MuxCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let decoded = roundtrip(Frame::data(42, payload.clone()));

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_frame_with_flags() {
        let decoded = roundtrip(Frame::fin(10));

        assert!(decoded.flags.has_fin());
        assert!(!decoded.flags.has_syn());
        assert!(!decoded.flags.has_rst());
    }

    #[test]
    fn test_ping_opaque() {
        let decoded = roundtrip(Frame::pong(7));

        assert_eq!(decoded.frame_type, FrameType::Ping);
        assert!(decoded.flags.has_ack());
        assert_eq!(decoded.ping_opaque(), Some(7));
    }

    #[test]
    fn test_window_update() {
        let decoded = roundtrip(Frame::window_update(5, 128 * 1024));

        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.stream_id, 5);
        assert_eq!(decoded.window_delta(), Some(128 * 1024));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = MuxCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data(1, Bytes::from("abcdef")), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(Frame::HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from("abcdef"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = MuxCodec::new(4);
        let mut buf = BytesMut::new();

        assert!(matches!(
            codec.encode(Frame::data(1, Bytes::from("too long")), &mut buf),
            Err(MuxError::FrameTooLarge(8))
        ));

        MuxCodec::new(1024)
            .encode(Frame::data(1, Bytes::from("too long")), &mut buf)
            .unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxError::FrameTooLarge(8))
        ));
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION);
        buf.put_u8(9);
        buf.put_u16(0);
        buf.put_u32(1);
        buf.put_u32(0);

        assert!(matches!(
            MuxCodec::new(1024).decode(&mut buf),
            Err(MuxError::InvalidFrameType(9))
        ));
    }
}
