//! Chunk Allocation Module
//!
//! Tracks which chunks of the staging region are free.
//!
//! ## Responsibilities
//! - One bit per chunk slot, packed into 64-bit atomic blocks
//! - Lock-free acquire (scan + fetch-or) and release (fetch-and)
//! - Occupancy sampling for monitoring
//!
//! ## Slot Lifecycle
//! ```text
//! Free ──acquire──▶ Allocated ──flush──▶ Draining ──log write done──▶ Free
//! ```

mod bitset;
mod allocator;

pub use bitset::AtomicBitset;
pub use allocator::ChunkAllocator;
