//! # StageKV
//!
//! A remote-write staging layer for a key/value store:
//! - Clients write records straight into server-side memory chunks
//! - Writes are batched per connection and committed a chunk at a time
//! - Filled chunks are logged to disk asynchronously and then recycled
//! - Reads see staged writes before they reach the backing store
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Clients (StagingClient)                     │
//! │     mailbox writes ─┐            ┌─ region writes (records)  │
//! └─────────────────────┼────────────┼──────────────────────────┘
//!                       │  Channel   │
//! ┌─────────────────────▼────────────▼──────────────────────────┐
//! │            Server ──▶ one Clerk per connection               │
//! └───────┬──────────────────┬───────────────────┬──────────────┘
//!         │                  │                   │
//!         ▼                  ▼                   ▼
//!  ┌─────────────┐   ┌──────────────┐    ┌──────────────┐
//!  │  Allocator  │   │ StagingIndex │    │ BackingStore │
//!  │  (bitset)   │   │  (DashMap)   │    │ (put_batch)  │
//!  └──────┬──────┘   └──────────────┘    └──────────────┘
//!         │ release on completion
//!  ┌──────┴────────────────┐
//!  │    FlushPipeline      │──▶ RingLog (pre-allocated file)
//!  └───────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod alloc;
pub mod arena;
pub mod index;
pub mod protocol;
pub mod transport;
pub mod store;
pub mod flush;
pub mod engine;
pub mod clerk;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StageError};
pub use config::Config;
pub use engine::Engine;
pub use network::{Server, StagingClient};
pub use store::{BackingStore, LogStore, MemoryStore};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StageKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
