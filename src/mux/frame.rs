//! Multiplexer Frame Codec
//!
//! Each frame has a 7-byte header: kind(1) + stream_id(4) + payload_len(2),
//! followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier type
pub type StreamId = u32;

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload carried by a single frame
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Stream id used by connection-level frames
pub const CONNECTION_STREAM_ID: StreamId = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Peer opened a new stream
    Open = 0x01,
    Data = 0x02,
    /// Sender will write no more data on the stream
    Fin = 0x03,
    /// Abrupt stream termination
    Reset = 0x04,
    /// Payload is a u32 credit increment
    WindowUpdate = 0x05,
    Ping = 0x06,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Fin),
            0x04 => Some(Self::Reset),
            0x05 => Some(Self::WindowUpdate),
            0x06 => Some(Self::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    fn empty(kind: FrameKind, stream_id: StreamId) -> Self {
        Self {
            kind,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::empty(FrameKind::Open, stream_id)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            stream_id,
            payload,
        }
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::empty(FrameKind::Fin, stream_id)
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::empty(FrameKind::Reset, stream_id)
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self {
            kind: FrameKind::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    pub fn ping() -> Self {
        Self::empty(FrameKind::Ping, CONNECTION_STREAM_ID)
    }

    /// Credit carried by a WindowUpdate frame
    pub fn credit(&self) -> Option<u32> {
        if self.kind != FrameKind::WindowUpdate || self.payload.len() != 4 {
            return None;
        }
        let mut payload = self.payload.clone();
        Some(payload.get_u32())
    }
}

/// Length-prefixed frame codec used on the raw transport
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u16::from_be_bytes([src[5], src[6]]) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", payload_len),
            ));
        }

        if src.len() < FRAME_HEADER_SIZE + payload_len {
            src.reserve(FRAME_HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        let kind = FrameKind::from_u8(src[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind: 0x{:02x}", src[0]),
            )
        })?;

        src.advance(1);
        let stream_id = src.get_u32();
        src.advance(2);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            kind,
            stream_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload too large: {} bytes", frame.payload.len()),
            ));
        }

        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        dst.put_u8(frame.kind as u8);
        dst.put_u32(frame.stream_id);
        dst.put_u16(frame.payload.len() as u16);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
