//! Frame encoding/decoding for the muxado session protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |        Length (3B)       |Typ|Flg |
//! +--------+--------+--------+--------+
//! |       Stream ID (4B, MSB = 0)     |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size (24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// Half-close flag
pub const FLAG_FIN: u8 = 0x1;

/// Stream open flag, carried on the first DATA frame of a stream
pub const FLAG_SYN: u8 = 0x2;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream reset
    Rst = 0x0,
    /// Data frame
    Data = 0x1,
    /// Window increment (flow control)
    WndInc = 0x2,
    /// Go away (session closing)
    GoAway = 0x3,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FrameType::Rst),
            0x1 => Ok(FrameType::Data),
            0x2 => Ok(FrameType::WndInc),
            0x3 => Ok(FrameType::GoAway),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// Error codes carried by RST and GOAWAY frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    ProtocolError = 1,
    InternalError = 2,
    FlowControlError = 3,
    StreamClosed = 4,
    StreamRefused = 5,
    StreamCancelled = 6,
    StreamReset = 7,
    FrameSizeError = 8,
    AcceptQueueFull = 9,
}

/// A session frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Flag bits (`FLAG_FIN`, `FLAG_SYN`)
    pub flags: u8,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes, flags: u8) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags,
            stream_id,
            payload,
        }
    }

    /// Create an empty data frame carrying only `FLAG_FIN` (plus `FLAG_SYN` if the stream was never announced)
    pub fn fin(stream_id: u32, syn: bool) -> Self {
        let flags = if syn { FLAG_FIN | FLAG_SYN } else { FLAG_FIN };
        Self::data(stream_id, Bytes::new(), flags)
    }

    /// Create a stream reset frame
    pub fn rst(stream_id: u32, code: ErrorCode) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code as u32);
        Self {
            frame_type: FrameType::Rst,
            flags: 0,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a window increment frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WndInc,
            flags: 0,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a go-away frame
    pub fn go_away(last_stream_id: u32, code: ErrorCode) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream_id & STREAM_ID_MASK);
        payload.put_u32(code as u32);
        Self {
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Whether the FIN flag is set
    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    /// Whether the SYN flag is set
    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    /// Read the leading big-endian u32 of the payload (RST code, WNDINC increment)
    pub fn body_u32(&self) -> Result<u32, TunnelError> {
        if self.payload.len() < 4 {
            return Err(TunnelError::InvalidFrame(format!(
                "{:?} frame body too short: {} bytes",
                self.frame_type,
                self.payload.len()
            )));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        // Length (3 bytes, big endian)
        buf.put_u8((payload_len >> 16) as u8);
        buf.put_u16(payload_len as u16);

        // Type (high nibble) and flags (low nibble)
        buf.put_u8(((self.frame_type as u8) << 4) | (self.flags & 0x0F));

        // Stream ID (4 bytes, reserved bit cleared)
        buf.put_u32(self.stream_id & STREAM_ID_MASK);

        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    /// Decode frame from bytes
    ///
    /// Returns `Ok(None)` until a complete frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header to get lengths
        let payload_len =
            ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | (buf[2] as usize);
        let frame_type = FrameType::try_from(buf[3] >> 4)?;
        let flags = buf[3] & 0x0F;
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) & STREAM_ID_MASK;

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            flags,
            stream_id,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::data(3, Bytes::from_static(b"hello"), FLAG_SYN);
        let encoded = frame.encode().unwrap();

        assert_eq!(&encoded[..FRAME_HEADER_SIZE], &[0, 0, 5, 0x12, 0, 0, 0, 3]);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], b"hello");
        assert_eq!(encoded.len(), frame.encoded_size());
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let frame = Frame::window_update(7, 1024);
        let encoded = frame.encode().unwrap();

        let mut partial = BytesMut::from(&encoded[..FRAME_HEADER_SIZE + 2]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());

        let mut full = BytesMut::from(&encoded[..]);
        let decoded = Frame::decode(&mut full).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::WndInc);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.body_u32().unwrap(), 1024);
        assert!(full.is_empty());
    }

    #[test]
    fn test_reserved_bit_is_masked() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0x11, 0x80, 0, 0, 2][..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.stream_id, 2);
        assert!(decoded.is_fin());
        assert!(!decoded.is_syn());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0x90, 0, 0, 0, 1][..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_fin_without_announce_carries_syn() {
        let frame = Frame::fin(5, true);
        assert!(frame.is_fin());
        assert!(frame.is_syn());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_rst_body() {
        let frame = Frame::rst(9, ErrorCode::FlowControlError);
        assert_eq!(frame.body_u32().unwrap(), 3);
    }
}
