//! Atomic bitset
//!
//! Fixed-size bitset packed into 64-bit atomic blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::Backoff;

const BITS_PER_BLOCK: usize = u64::BITS as usize;

/// A fixed-size bitset whose bits can be claimed concurrently
pub struct AtomicBitset {
    /// Number of usable bits
    size: usize,
    /// Packed bits, bit `i` lives in `blocks[i / 64]`
    blocks: Box<[AtomicU64]>,
}

impl AtomicBitset {
    /// Create a bitset of `size` bits, all clear
    pub fn new(size: usize) -> Self {
        let num_blocks = size.div_ceil(BITS_PER_BLOCK);
        let blocks = (0..num_blocks).map(|_| AtomicU64::new(0)).collect();
        Self { size, blocks }
    }

    /// Number of bits
    pub fn size(&self) -> usize {
        self.size
    }

    /// Set bit `idx`, returning its previous value
    pub fn set(&self, idx: usize, order: Ordering) -> bool {
        let (block, mask) = self.locate(idx);
        self.blocks[block].fetch_or(mask, order) & mask != 0
    }

    /// Clear bit `idx`, returning its previous value
    pub fn clear(&self, idx: usize, order: Ordering) -> bool {
        let (block, mask) = self.locate(idx);
        self.blocks[block].fetch_and(!mask, order) & mask != 0
    }

    /// Read bit `idx`
    pub fn get(&self, idx: usize, order: Ordering) -> bool {
        let (block, mask) = self.locate(idx);
        self.blocks[block].load(order) & mask != 0
    }

    /// One pass over the bitset, claiming the first clear bit.
    ///
    /// A relaxed probe skips bits that look taken; the claim itself is an
    /// acquire read-modify-write. Losing a race moves on to the next bit
    /// instead of restarting.
    pub fn try_claim(&self) -> Option<usize> {
        (0..self.size).find(|&idx| {
            !self.get(idx, Ordering::Relaxed) && !self.set(idx, Ordering::Acquire)
        })
    }

    /// Claim a clear bit, spinning until one becomes available.
    ///
    /// No fairness: a caller can be overtaken indefinitely while the set
    /// stays full.
    pub fn claim(&self) -> usize {
        let backoff = Backoff::new();
        loop {
            if let Some(idx) = self.try_claim() {
                return idx;
            }
            backoff.snooze();
        }
    }

    /// Count of set bits at this instant
    pub fn count_ones(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn locate(&self, idx: usize) -> (usize, u64) {
        assert!(idx < self.size, "bit {} out of range {}", idx, self.size);
        (idx / BITS_PER_BLOCK, 1u64 << (idx % BITS_PER_BLOCK))
    }
}
