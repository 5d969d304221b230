//! Reply definitions
//!
//! Represents replies to clients.

use crate::error::{Result, StageError};

/// Reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Error = 2,
}

impl Status {
    /// Parse a status word
    pub fn from_word(word: u32) -> Result<Self> {
        match word {
            0 => Ok(Status::Ok),
            1 => Ok(Status::NotFound),
            2 => Ok(Status::Error),
            other => Err(StageError::Protocol(format!(
                "Unknown reply status: 0x{:08x}",
                other
            ))),
        }
    }
}

/// A reply written back into the client's mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status code
    pub status: Status,

    /// Value for GET, chunk base for ALLOC, message for ERROR
    pub payload: Vec<u8>,
}

impl Reply {
    /// Create an OK reply with a payload
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    /// Create an OK reply with no payload
    pub fn ack() -> Self {
        Self::ok(Vec::new())
    }

    /// Create a NOT_FOUND reply
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: Vec::new(),
        }
    }

    /// Create an ERROR reply
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: message.as_bytes().to_vec(),
        }
    }

    /// ALLOC reply carrying the chunk's region-global base offset
    pub fn chunk_base(offset: u64) -> Self {
        Self::ok(offset.to_le_bytes().to_vec())
    }

    /// Read back the base offset from an ALLOC reply
    pub fn as_chunk_base(&self) -> Result<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().map_err(|_| {
            StageError::Protocol(format!(
                "ALLOC reply carries {} bytes, expected 8",
                self.payload.len()
            ))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
