//! Engine Module
//!
//! Shared state behind every clerk.
//!
//! ## Responsibilities
//! - Own the staging arena, chunk allocator and staging index
//! - Route reads through the staging index before the backing store
//! - Commit a filled chunk to the backing store and hand it to the flush
//!   pipeline for durable logging

use std::fs;
use std::sync::Arc;

use crate::alloc::ChunkAllocator;
use crate::arena::{ChunkArena, ChunkId};
use crate::config::Config;
use crate::error::Result;
use crate::flush::{DurableLog, FlushJob, FlushPipeline, PipelineStats, RingLog, RING_LOG_FILENAME};
use crate::index::{Location, StagingIndex};
use crate::store::{BackingStore, BatchEntry};

/// The staging engine shared by all connections
///
/// ## Concurrency Model
///
/// Nothing here takes a global lock:
/// - the allocator is a lock-free bitset
/// - the staging index is a sharded concurrent map
/// - each chunk has its own `RwLock`, written only by the clerk that owns it
/// - the backing store handles its own synchronization
///
/// A chunk is owned by exactly one clerk from `acquire_chunk` until it is
/// handed to `flush_chunk`; from then on the pipeline owns it until the
/// durable write completes.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Remotely writable staging region
    arena: Arc<ChunkArena>,

    /// Free/in-use state of every chunk slot
    allocator: Arc<ChunkAllocator>,

    /// Writes not yet committed to the backing store
    index: StagingIndex,

    /// Engine of record
    store: Arc<dyn BackingStore>,

    /// Durable logging of flushed chunks
    pipeline: FlushPipeline,
}

impl Engine {
    /// Open an engine logging to `{data_dir}/staging.log`
    pub fn open(config: Config, store: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let arena = Arc::new(ChunkArena::new(config.chunk_size, config.chunk_count));
        let log = RingLog::open(
            &config.data_dir.join(RING_LOG_FILENAME),
            config.log_capacity,
            config.io_queue_depth,
            config.sync_on_write,
            Arc::clone(&arena),
        )?;

        Self::assemble(config, arena, store, Arc::new(log))
    }

    /// Open an engine over a caller-supplied durable log
    ///
    /// Nothing is created on disk.
    pub fn with_log(
        config: Config,
        store: Arc<dyn BackingStore>,
        log: Arc<dyn DurableLog>,
    ) -> Result<Self> {
        config.validate()?;
        let arena = Arc::new(ChunkArena::new(config.chunk_size, config.chunk_count));
        Self::assemble(config, arena, store, log)
    }

    fn assemble(
        config: Config,
        arena: Arc<ChunkArena>,
        store: Arc<dyn BackingStore>,
        log: Arc<dyn DurableLog>,
    ) -> Result<Self> {
        let allocator = Arc::new(ChunkAllocator::new(config.chunk_count));
        let pipeline = FlushPipeline::start(
            log,
            Arc::clone(&allocator),
            config.io_queue_depth,
            config.usage_report_interval,
        )?;

        tracing::info!(
            "Engine ready: {} chunks of {} bytes, {} store, I/O depth {}",
            config.chunk_count,
            config.chunk_size,
            store.name(),
            config.io_queue_depth
        );

        Ok(Self {
            config,
            arena,
            allocator,
            index: StagingIndex::new(),
            store,
            pipeline,
        })
    }

    // =========================================================================
    // Reads and deletes
    // =========================================================================

    /// Look up a key, staging index first
    ///
    /// A staged value is copied out of its chunk while the index entry is
    /// pinned. A flush erases the entry before queueing the chunk, so the
    /// chunk cannot be recycled under the copy.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let staged = self.index.with_entry(key, |location| match *location {
            Location::InMemory { chunk, .. } => {
                let range = location.value_range();
                Some(self.arena.read(chunk, range.start, range.len()))
            }
            Location::OnDisk { .. } => None,
        });
        match staged {
            Some(Some(value)) => value.map(Some),
            _ => self.store.get(key),
        }
    }

    /// Delete from the backing store
    ///
    /// A staged write of the same key is left in the staging index and
    /// stays visible to GET until its chunk is flushed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.store.delete(key)
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Publish a staged write
    pub fn stage(&self, key: Vec<u8>, location: Location) -> Option<Location> {
        self.index.insert(key, location)
    }

    /// Claim a chunk, spinning until one is free
    pub fn acquire_chunk(&self) -> ChunkId {
        self.allocator.acquire()
    }

    /// Return a chunk that was never handed to the pipeline
    pub fn release_chunk(&self, chunk: ChunkId) {
        self.allocator.release(chunk);
    }

    /// Region-global offset of `chunk`, as advertised to clients
    pub fn chunk_base(&self, chunk: ChunkId) -> u64 {
        self.arena.base_offset(chunk)
    }

    /// Commit the first `len` bytes of `chunk` and queue it for logging
    ///
    /// `batch` holds the persisted locations of every record staged in the
    /// chunk. The batch is written to the backing store straight from the
    /// chunk, then each key leaves the staging index unless a newer write
    /// has replaced it. On error the chunk and its index entries are left
    /// as they were.
    pub fn flush_chunk(&self, chunk: ChunkId, len: usize, batch: &[BatchEntry]) -> Result<()> {
        self.arena
            .with_chunk(chunk, len, |image| self.store.put_batch(batch, image))??;

        let mut erased = 0usize;
        for entry in batch {
            let location = &entry.location;
            let staged = Location::InMemory {
                chunk,
                offset: location.offset(),
                key_len: location.key_len(),
                val_len: location.val_len(),
            };
            if self.index.erase_if(&entry.key, &staged) {
                erased += 1;
            }
        }
        tracing::debug!(
            "Flushed {} ({} bytes, {} records, {} unstaged)",
            chunk,
            len,
            batch.len(),
            erased
        );

        if let Err(e) = self.pipeline.enqueue(FlushJob { chunk, len }) {
            // The store already holds the batch; only the log copy is lost.
            tracing::warn!("Could not queue {} for durable logging: {}", chunk, e);
            self.allocator.release(chunk);
        }
        Ok(())
    }

    // =========================================================================
    // Monitoring and lifecycle
    // =========================================================================

    /// Fraction of chunk slots in use
    pub fn usage(&self) -> f32 {
        self.allocator.usage()
    }

    /// Flush pipeline counters
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Drain the flush pipeline; later flushes skip durable logging
    pub fn shutdown(&self) -> Result<PipelineStats> {
        self.pipeline.shutdown()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arena(&self) -> &Arc<ChunkArena> {
        &self.arena
    }

    pub fn allocator(&self) -> &Arc<ChunkAllocator> {
        &self.allocator
    }

    pub fn index(&self) -> &StagingIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }
}
