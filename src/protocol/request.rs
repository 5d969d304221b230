//! Request definitions
//!
//! Represents requests from clients.

use crate::error::{Result, StageError};

/// Largest key the 24-bit length field can describe
pub const MAX_KEY_LEN: usize = (1 << 24) - 1;

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Put = 0,
    Get = 1,
    Update = 2,
    Delete = 3,
    Close = 4,
    Alloc = 5,
}

impl TryFrom<u8> for Op {
    type Error = StageError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Op::Put),
            1 => Ok(Op::Get),
            2 => Ok(Op::Update),
            3 => Ok(Op::Delete),
            4 => Ok(Op::Close),
            5 => Ok(Op::Alloc),
            other => Err(StageError::Protocol(format!(
                "Unknown operation: 0x{:02x}",
                other
            ))),
        }
    }
}

/// Fixed-size request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub op: Op,
    pub key_len: u32,
    pub val_len: u32,
}

impl RequestHeader {
    pub fn new(op: Op, key_len: usize, val_len: usize) -> Result<Self> {
        if key_len > MAX_KEY_LEN {
            return Err(StageError::Protocol(format!(
                "Key of {} bytes exceeds max {}",
                key_len, MAX_KEY_LEN
            )));
        }
        let val_len = u32::try_from(val_len).map_err(|_| {
            StageError::Protocol(format!("Value of {} bytes is too large", val_len))
        })?;
        Ok(Self {
            op,
            key_len: key_len as u32,
            val_len,
        })
    }

    /// Size of the full staged record: header + key + value
    pub fn record_len(&self) -> usize {
        super::REQUEST_HEADER_SIZE + self.key_len as usize + self.val_len as usize
    }
}

/// A decoded request: header plus key bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub key: Vec<u8>,
}

impl Request {
    pub fn op(&self) -> Op {
        self.header.op
    }
}
