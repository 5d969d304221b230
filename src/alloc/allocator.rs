//! Chunk Allocator
//!
//! Hands out chunk slots of the staging arena to clerks.

use std::sync::atomic::Ordering;

use super::AtomicBitset;
use crate::arena::ChunkId;

/// Lock-free allocator over a fixed number of chunk slots
///
/// ## Waiting policy
/// `acquire` spins (with backoff) until a slot frees up. There is no
/// bound and no fairness; never call it from a context that must finish
/// before a slot can be released.
pub struct ChunkAllocator {
    bitmap: AtomicBitset,
}

impl ChunkAllocator {
    /// Create an allocator with `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        Self {
            bitmap: AtomicBitset::new(capacity),
        }
    }

    /// Claim a free slot, blocking until one exists
    pub fn acquire(&self) -> ChunkId {
        let slot = ChunkId::new(self.bitmap.claim());
        tracing::trace!("Acquired {}", slot);
        slot
    }

    /// Claim a free slot if one is available right now
    pub fn try_acquire(&self) -> Option<ChunkId> {
        self.bitmap.try_claim().map(ChunkId::new)
    }

    /// Return a slot to the free pool
    ///
    /// Releasing a slot that is already free is logged and ignored.
    pub fn release(&self, slot: ChunkId) {
        if !self.bitmap.clear(slot.index(), Ordering::Release) {
            tracing::warn!("Released {} which was not allocated", slot);
        } else {
            tracing::trace!("Released {}", slot);
        }
    }

    /// Whether `slot` is currently allocated
    pub fn is_allocated(&self, slot: ChunkId) -> bool {
        self.bitmap.get(slot.index(), Ordering::Acquire)
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.bitmap.size()
    }

    /// Number of slots in use at this instant
    pub fn in_use(&self) -> usize {
        self.bitmap.count_ones()
    }

    /// Fraction of slots in use, sampled without synchronization
    pub fn usage(&self) -> f32 {
        if self.capacity() == 0 {
            return 0.0;
        }
        self.in_use() as f32 / self.capacity() as f32
    }
}
