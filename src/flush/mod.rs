//! Durable Flush Module
//!
//! Persists filled chunks to the ring log and recycles their slots.
//!
//! ## Flow
//! ```text
//!  clerk ──enqueue(FlushJob)──▶ work queue ──▶ consumer thread
//!                                                 │ submit (≤ io_queue_depth in flight)
//!                                                 ▼
//!                                             DurableLog ──completion──▶ allocator.release(chunk)
//! ```
//!
//! ## Ordering
//! A slot is released only after the log reports its write complete. A
//! chunk is queued only after its keys left the staging index, and GET
//! copies staged values while holding the index entry, so a reader never
//! sees a recycled chunk.

mod ring_log;
mod pipeline;

pub use ring_log::{RingLog, RING_LOG_FILENAME};
pub use pipeline::{FlushPipeline, PipelineStats};

use crossbeam::channel::Receiver;

use crate::arena::ChunkId;
use crate::error::Result;

/// A filled chunk waiting to be written to the durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushJob {
    pub chunk: ChunkId,

    /// Bytes of the chunk holding records
    pub len: usize,
}

/// Result of one durable log write
#[derive(Debug)]
pub struct LogCompletion {
    pub chunk: ChunkId,

    /// Log offset the chunk landed at, or the failure
    pub result: Result<u64>,
}

/// Append-capable sink with a submit / poll-completion interface
pub trait DurableLog: Send + Sync {
    /// Queue a write; must not wait for it to complete
    fn submit(&self, job: FlushJob) -> Result<()>;

    /// Completions, one per submitted job, in any order
    fn completions(&self) -> &Receiver<LogCompletion>;
}
