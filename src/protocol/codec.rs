//! Protocol codec
//!
//! Encoding and decoding of requests, replies and staged records.
//!
//! ## Wire Format
//!
//! ### Request Header
//! ```text
//! byte 0      op
//! bytes 1..4  key_len (24-bit little-endian)
//! bytes 4..8  val_len (32-bit little-endian)
//! ```
//!
//! ### Reply Header
//! ```text
//! bytes 0..4  status  (32-bit little-endian)
//! bytes 4..8  val_len (32-bit little-endian)
//! ```

use bytes::{BufMut, BytesMut};

use super::{Op, Reply, Request, RequestHeader, Status};
use crate::error::{Result, StageError};

/// Request header size: op (1) + key_len (3) + val_len (4)
pub const REQUEST_HEADER_SIZE: usize = 8;

/// Reply header size: status (4) + val_len (4)
pub const REPLY_HEADER_SIZE: usize = 8;

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

fn put_header(buf: &mut BytesMut, header: &RequestHeader) {
    buf.put_u32_le(header.op as u32 | (header.key_len << 8));
    buf.put_u32_le(header.val_len);
}

/// Encode the mailbox form of a request: header + key
///
/// `val_len` is recorded for writes whose value travels separately into
/// the staging chunk.
pub fn encode_request(op: Op, key: &[u8], val_len: usize) -> Result<BytesMut> {
    let header = RequestHeader::new(op, key.len(), val_len)?;
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + key.len());
    put_header(&mut buf, &header);
    buf.put_slice(key);
    Ok(buf)
}

/// Encode a full staged record: header + key + value
pub fn encode_record(op: Op, key: &[u8], value: &[u8]) -> Result<BytesMut> {
    let header = RequestHeader::new(op, key.len(), value.len())?;
    let mut buf = BytesMut::with_capacity(header.record_len());
    put_header(&mut buf, &header);
    buf.put_slice(key);
    buf.put_slice(value);
    Ok(buf)
}

/// Decode a request from the front of a mailbox body
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    if bytes.len() < REQUEST_HEADER_SIZE {
        return Err(StageError::Protocol(format!(
            "Incomplete request header: expected {} bytes, got {}",
            REQUEST_HEADER_SIZE,
            bytes.len()
        )));
    }

    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let op = Op::try_from((word & 0xff) as u8)?;
    let key_len = word >> 8;
    let val_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let key_end = REQUEST_HEADER_SIZE + key_len as usize;
    if bytes.len() < key_end {
        return Err(StageError::Protocol(format!(
            "Incomplete key: expected {} bytes, got {}",
            key_len,
            bytes.len() - REQUEST_HEADER_SIZE
        )));
    }

    Ok(Request {
        header: RequestHeader { op, key_len, val_len },
        key: bytes[REQUEST_HEADER_SIZE..key_end].to_vec(),
    })
}

// =============================================================================
// Reply Encoding/Decoding
// =============================================================================

/// Encode a reply to bytes
pub fn encode_reply(reply: &Reply) -> BytesMut {
    let mut buf = BytesMut::with_capacity(REPLY_HEADER_SIZE + reply.payload.len());
    buf.put_u32_le(reply.status as u32);
    buf.put_u32_le(reply.payload.len() as u32);
    buf.put_slice(&reply.payload);
    buf
}

/// Decode a reply from the front of a mailbox body
pub fn decode_reply(bytes: &[u8]) -> Result<Reply> {
    if bytes.len() < REPLY_HEADER_SIZE {
        return Err(StageError::Protocol(format!(
            "Incomplete reply header: expected {} bytes, got {}",
            REPLY_HEADER_SIZE,
            bytes.len()
        )));
    }

    let status = Status::from_word(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))?;
    let val_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let end = REPLY_HEADER_SIZE + val_len;
    if bytes.len() < end {
        return Err(StageError::Protocol(format!(
            "Incomplete reply payload: expected {} bytes, got {}",
            val_len,
            bytes.len() - REPLY_HEADER_SIZE
        )));
    }

    Ok(Reply {
        status,
        payload: bytes[REPLY_HEADER_SIZE..end].to_vec(),
    })
}
