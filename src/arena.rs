//! Staging Arena
//!
//! The remotely writable staging region, carved into fixed-size chunks.
//!
//! ## Addressing
//! Clients address the region with a region-global byte offset
//! (`chunk_base + offset_in_chunk`); the server addresses it with
//! `(ChunkId, offset)` pairs. Every access is bounds-checked and a single
//! access never spans two chunks.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │   chunk 0    │   chunk 1    │   chunk 2    │ ... │
//! └──────────────┴──────────────┴──────────────┴─────┘
//! 0          chunk_size    2*chunk_size
//! ```
//!
//! Each chunk sits behind its own `RwLock`, so concurrent readers of a
//! staged value never contend with writers of other chunks.

use std::fmt;

use parking_lot::RwLock;

use crate::error::{Result, StageError};

/// Index of a chunk slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u32);

impl ChunkId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Fixed-size chunks backing the staging region
pub struct ChunkArena {
    chunk_size: usize,
    chunks: Vec<RwLock<Box<[u8]>>>,
}

impl ChunkArena {
    /// Allocate `chunk_count` zeroed chunks of `chunk_size` bytes
    pub fn new(chunk_size: usize, chunk_count: usize) -> Self {
        let chunks = (0..chunk_count)
            .map(|_| RwLock::new(vec![0u8; chunk_size].into_boxed_slice()))
            .collect();
        Self { chunk_size, chunks }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total region size in bytes
    pub fn region_size(&self) -> u64 {
        (self.chunk_size * self.chunks.len()) as u64
    }

    /// Region-global offset of the first byte of `chunk`
    pub fn base_offset(&self, chunk: ChunkId) -> u64 {
        chunk.index() as u64 * self.chunk_size as u64
    }

    /// Map a region-global range onto a single chunk
    pub fn locate(&self, offset: u64, len: usize) -> Result<(ChunkId, usize)> {
        let index = (offset / self.chunk_size as u64) as usize;
        let within = (offset % self.chunk_size as u64) as usize;
        if index >= self.chunks.len() {
            return Err(StageError::OutOfBounds(format!(
                "offset {} beyond region of {} bytes",
                offset,
                self.region_size()
            )));
        }
        if within + len > self.chunk_size {
            return Err(StageError::OutOfBounds(format!(
                "{} bytes at offset {} cross the end of chunk {}",
                len, offset, index
            )));
        }
        Ok((ChunkId::new(index), within))
    }

    /// Write at a region-global offset (the one-sided remote write path)
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let (chunk, within) = self.locate(offset, bytes.len())?;
        self.write(chunk, within, bytes)
    }

    /// Write `bytes` into `chunk` at `offset`
    pub fn write(&self, chunk: ChunkId, offset: usize, bytes: &[u8]) -> Result<()> {
        let slot = self.slot(chunk)?;
        let range = self.range(chunk, offset, bytes.len())?;
        slot.write()[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes out of `chunk` starting at `offset`
    pub fn read(&self, chunk: ChunkId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let slot = self.slot(chunk)?;
        let range = self.range(chunk, offset, len)?;
        Ok(slot.read()[range].to_vec())
    }

    /// Borrow the first `len` bytes of `chunk` without copying
    pub fn with_chunk<R>(&self, chunk: ChunkId, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = self.slot(chunk)?;
        let range = self.range(chunk, 0, len)?;
        let guard = slot.read();
        Ok(f(&guard[range]))
    }

    fn slot(&self, chunk: ChunkId) -> Result<&RwLock<Box<[u8]>>> {
        self.chunks.get(chunk.index()).ok_or_else(|| {
            StageError::OutOfBounds(format!(
                "{} does not exist (arena has {} chunks)",
                chunk,
                self.chunks.len()
            ))
        })
    }

    fn range(&self, chunk: ChunkId, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.chunk_size => Ok(offset..end),
            _ => Err(StageError::OutOfBounds(format!(
                "{} bytes at offset {} exceed {} of {} bytes",
                len, offset, chunk, self.chunk_size
            ))),
        }
    }
}
