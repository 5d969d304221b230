//! Transport frames
//!
//! Frames carrying one-sided writes across a TCP stream.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Tag (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Payload by Tag (big-endian)
//! - 0x01 HELLO:   chunk_size (4) + chunk_count (4) + message_size (4)
//! - 0x02 MESSAGE: offset (4) + bytes      → peer mailbox body
//! - 0x03 REGION:  offset (8) + bytes      → peer staging region
//! - 0x04 SIGNAL:  value (4)               → peer handshake flag

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StageError};

/// Frame header size: 1 byte tag + 4 bytes length
const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

const TAG_HELLO: u8 = 0x01;
const TAG_MESSAGE: u8 = 0x02;
const TAG_REGION: u8 = 0x03;
const TAG_SIGNAL: u8 = 0x04;

/// A unit of traffic on an emulated remote-memory link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Server → client geometry announcement, sent once on accept
    Hello {
        chunk_size: u32,
        chunk_count: u32,
        message_size: u32,
    },

    /// Write into the peer's mailbox body
    Message { offset: u32, data: Bytes },

    /// Write into the peer's staging region
    Region { offset: u64, data: Bytes },

    /// Store into the peer's handshake flag
    Signal { value: u32 },
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Hello { .. } => TAG_HELLO,
            Frame::Message { .. } => TAG_MESSAGE,
            Frame::Region { .. } => TAG_REGION,
            Frame::Signal { .. } => TAG_SIGNAL,
        }
    }

    /// Encode to bytes: tag (1) + payload_len (4) + payload
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        match self {
            Frame::Hello { chunk_size, chunk_count, message_size } => {
                payload.put_u32(*chunk_size);
                payload.put_u32(*chunk_count);
                payload.put_u32(*message_size);
            }
            Frame::Message { offset, data } => {
                payload.put_u32(*offset);
                payload.put_slice(data);
            }
            Frame::Region { offset, data } => {
                payload.put_u64(*offset);
                payload.put_slice(data);
            }
            Frame::Signal { value } => payload.put_u32(*value),
        }

        let mut message = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        message.put_u8(self.tag());
        message.put_u32(payload.len() as u32);
        message.put_slice(&payload);
        message
    }

    /// Decode a frame body given its tag
    fn decode(tag: u8, mut payload: Bytes) -> Result<Self> {
        let need = |n: usize, payload: &Bytes, what: &str| {
            if payload.len() < n {
                Err(StageError::Protocol(format!(
                    "{} frame: expected at least {} bytes, got {}",
                    what,
                    n,
                    payload.len()
                )))
            } else {
                Ok(())
            }
        };

        match tag {
            TAG_HELLO => {
                need(12, &payload, "HELLO")?;
                Ok(Frame::Hello {
                    chunk_size: payload.get_u32(),
                    chunk_count: payload.get_u32(),
                    message_size: payload.get_u32(),
                })
            }
            TAG_MESSAGE => {
                need(4, &payload, "MESSAGE")?;
                let offset = payload.get_u32();
                Ok(Frame::Message { offset, data: payload })
            }
            TAG_REGION => {
                need(8, &payload, "REGION")?;
                let offset = payload.get_u64();
                Ok(Frame::Region { offset, data: payload })
            }
            TAG_SIGNAL => {
                need(4, &payload, "SIGNAL")?;
                Ok(Frame::Signal { value: payload.get_u32() })
            }
            other => Err(StageError::Protocol(format!(
                "Unknown frame tag: 0x{:02x}",
                other
            ))),
        }
    }
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete frame from a stream
///
/// Blocks until a complete frame is received or an error occurs
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(StageError::Protocol(format!(
            "Frame payload too large: {} bytes (max {})",
            payload_len, MAX_FRAME_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    Frame::decode(header[0], Bytes::from(payload))
}

/// Write a frame to a stream without flushing
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode())?;
    Ok(())
}
