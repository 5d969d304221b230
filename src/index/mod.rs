//! Staging Index Module
//!
//! Reconciles writes still sitting in staging chunks with the backing store.
//!
//! ## Responsibilities
//! - Map key → most recent not-yet-durable write
//! - Concurrent access from every clerk without a global lock
//! - Absence means "ask the backing store"
//!
//! ## Record Layout Inside a Chunk
//! ```text
//! ┌──────────────┬───────────┬─────────────┐
//! │ Header (8)   │    Key    │    Value    │
//! └──────────────┴───────────┴─────────────┘
//!                ▲
//!                └── Location offset
//! ```

mod staging;

pub use staging::StagingIndex;

use std::ops::Range;

use crate::arena::ChunkId;

/// Where the bytes of a staged record live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Still in a staging chunk (valid while the chunk is Allocated or Draining)
    InMemory {
        chunk: ChunkId,
        offset: u32,
        key_len: u32,
        val_len: u32,
    },

    /// Inside a persisted segment image, relative to its first byte
    OnDisk {
        segment: u32,
        offset: u32,
        key_len: u32,
        val_len: u32,
    },
}

impl Location {
    pub fn key_len(&self) -> u32 {
        match *self {
            Location::InMemory { key_len, .. } | Location::OnDisk { key_len, .. } => key_len,
        }
    }

    pub fn val_len(&self) -> u32 {
        match *self {
            Location::InMemory { val_len, .. } | Location::OnDisk { val_len, .. } => val_len,
        }
    }

    /// Offset of the key bytes
    pub fn offset(&self) -> u32 {
        match *self {
            Location::InMemory { offset, .. } | Location::OnDisk { offset, .. } => offset,
        }
    }

    /// Byte range of the value, relative to the chunk or segment start
    pub fn value_range(&self) -> Range<usize> {
        let start = self.offset() as usize + self.key_len() as usize;
        start..start + self.val_len() as usize
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Location::InMemory { .. })
    }

    /// The same record, addressed inside the segment persisted from its chunk
    pub fn persisted(&self) -> Location {
        match *self {
            Location::InMemory { chunk, offset, key_len, val_len } => Location::OnDisk {
                segment: chunk.index() as u32,
                offset,
                key_len,
                val_len,
            },
            on_disk => on_disk,
        }
    }
}
