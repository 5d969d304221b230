//! Ring Log
//!
//! Pre-allocated append-only file used as a capacity-bounded durability
//! sink. Offsets only move forward; a write that would pass the end of
//! the file wraps to offset 0. There is no replay format.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{DurableLog, FlushJob, LogCompletion};
use crate::arena::ChunkArena;
use crate::error::{Result, StageError};

/// File name of the ring log inside the data directory
pub const RING_LOG_FILENAME: &str = "staging.log";

/// File-backed ring log written by a pool of I/O threads
///
/// Each I/O thread writes straight out of the chunk in the arena, so the
/// chunk must stay allocated until its completion is observed.
pub struct RingLog {
    path: PathBuf,
    capacity: u64,
    /// Next write offset
    next_offset: Mutex<u64>,
    submissions: Option<Sender<(FlushJob, u64)>>,
    completions: Receiver<LogCompletion>,
    workers: Vec<JoinHandle<()>>,
}

impl RingLog {
    /// Create (or reuse) the log file at `path`, sized to `capacity`
    ///
    /// `depth` I/O threads service writes concurrently.
    pub fn open(
        path: &Path,
        capacity: u64,
        depth: usize,
        sync_on_write: bool,
        arena: Arc<ChunkArena>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity)?;
        let file = Arc::new(file);

        let (submit_tx, submit_rx) = unbounded::<(FlushJob, u64)>();
        let (done_tx, done_rx) = unbounded();

        let mut workers = Vec::with_capacity(depth);
        for worker_id in 0..depth.max(1) {
            let file = Arc::clone(&file);
            let arena = Arc::clone(&arena);
            let submit_rx = submit_rx.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ringlog-io-{}", worker_id))
                .spawn(move || {
                    for (job, offset) in submit_rx.iter() {
                        let result = write_chunk(&file, &arena, job, offset, sync_on_write);
                        if done_tx.send(LogCompletion { chunk: job.chunk, result }).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }

        tracing::debug!(
            "Opened ring log {} ({} bytes, {} I/O threads)",
            path.display(),
            capacity,
            workers.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            capacity,
            next_offset: Mutex::new(0),
            submissions: Some(submit_tx),
            completions: done_rx,
            workers,
        })
    }

    /// Reserve `len` bytes, wrapping to the start when they would not fit
    fn reserve(&self, len: u64) -> Result<u64> {
        if len > self.capacity {
            return Err(StageError::LogCapacity {
                len,
                capacity: self.capacity,
            });
        }
        let mut next = self.next_offset.lock();
        let offset = if *next + len > self.capacity { 0 } else { *next };
        *next = offset + len;
        Ok(offset)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Offset the next write will be placed at, before any wrap
    pub fn next_offset(&self) -> u64 {
        *self.next_offset.lock()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for RingLog {
    fn submit(&self, job: FlushJob) -> Result<()> {
        let offset = self.reserve(job.len as u64)?;
        let submissions = self.submissions.as_ref().ok_or(StageError::PipelineClosed)?;
        submissions
            .send((job, offset))
            .map_err(|_| StageError::PipelineClosed)
    }

    fn completions(&self) -> &Receiver<LogCompletion> {
        &self.completions
    }
}

impl Drop for RingLog {
    fn drop(&mut self) {
        // Closing the queue lets every I/O thread finish its backlog and exit.
        self.submissions.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn write_chunk(
    file: &File,
    arena: &ChunkArena,
    job: FlushJob,
    offset: u64,
    sync_on_write: bool,
) -> Result<u64> {
    arena.with_chunk(job.chunk, job.len, |bytes| file.write_all_at(bytes, offset))??;
    if sync_on_write {
        file.sync_data()?;
    }
    Ok(offset)
}
