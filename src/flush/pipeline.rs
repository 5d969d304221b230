//! Flush Pipeline
//!
//! A single consumer thread moves jobs from the work queue into the
//! durable log, keeping at most `depth` writes in flight, and returns each
//! chunk to the allocator once its write completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use super::{DurableLog, FlushJob, LogCompletion};
use crate::alloc::ChunkAllocator;
use crate::error::{Result, StageError};

/// Counters describing pipeline throughput
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Jobs handed to the durable log
    pub submitted: u64,

    /// Writes that finished, successfully or not
    pub completed: u64,

    /// Submissions or writes that failed
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Queue of filled chunks feeding the durable log
pub struct FlushPipeline {
    /// Dropped on shutdown to disconnect the consumer
    sender: RwLock<Option<Sender<FlushJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl FlushPipeline {
    /// Spawn the consumer thread
    ///
    /// Every `report_interval` completions the allocator's usage is logged;
    /// zero disables the report.
    pub fn start(
        log: Arc<dyn DurableLog>,
        allocator: Arc<ChunkAllocator>,
        depth: usize,
        report_interval: u64,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let counters = Arc::new(Counters::default());

        let consumer = Consumer {
            log,
            allocator,
            depth: depth.max(1),
            report_interval,
            counters: Arc::clone(&counters),
            in_flight: 0,
        };
        let worker = thread::Builder::new()
            .name("flush-pipeline".to_string())
            .spawn(move || consumer.run(receiver))?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    /// Queue a filled chunk for writing; never waits on I/O
    pub fn enqueue(&self, job: FlushJob) -> Result<()> {
        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or(StageError::PipelineClosed)?;
        sender.send(job).map_err(|_| StageError::PipelineClosed)
    }

    /// Counters at this instant
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Stop accepting jobs, drain everything queued, and wait for the
    /// consumer to exit
    ///
    /// Calling it again returns the final counters.
    pub fn shutdown(&self) -> Result<PipelineStats> {
        self.sender.write().take();
        if let Some(worker) = self.worker.lock().take() {
            worker
                .join()
                .map_err(|_| StageError::Store("flush pipeline thread panicked".to_string()))?;
            let stats = self.counters.snapshot();
            tracing::info!(
                "Flush pipeline stopped: {} submitted, {} completed, {} failed",
                stats.submitted,
                stats.completed,
                stats.failed
            );
        }
        Ok(self.counters.snapshot())
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Flush pipeline shutdown failed: {}", e);
        }
    }
}

struct Consumer {
    log: Arc<dyn DurableLog>,
    allocator: Arc<ChunkAllocator>,
    depth: usize,
    report_interval: u64,
    counters: Arc<Counters>,
    in_flight: usize,
}

impl Consumer {
    fn run(mut self, work: Receiver<FlushJob>) {
        let log = Arc::clone(&self.log);
        let completions = log.completions();
        let mut accepting = true;

        loop {
            if accepting && self.in_flight < self.depth {
                select! {
                    recv(work) -> job => match job {
                        Ok(job) => self.submit(job),
                        Err(_) => accepting = false,
                    },
                    recv(completions) -> done => match done {
                        Ok(done) => self.complete(done),
                        Err(_) => break,
                    },
                }
            } else if self.in_flight > 0 {
                match completions.recv() {
                    Ok(done) => self.complete(done),
                    Err(_) => break,
                }
            } else {
                break;
            }
        }

        if self.in_flight > 0 {
            tracing::error!(
                "Durable log closed with {} writes outstanding; their chunks stay allocated",
                self.in_flight
            );
        }
    }

    fn submit(&mut self, job: FlushJob) {
        match self.log.submit(job) {
            Ok(()) => {
                self.in_flight += 1;
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Submitted {} ({} bytes)", job.chunk, job.len);
            }
            Err(e) => {
                // Nothing is reading the chunk, so it can go back right away.
                tracing::error!("Failed to submit {} to durable log: {}", job.chunk, e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.allocator.release(job.chunk);
            }
        }
    }

    fn complete(&mut self, done: LogCompletion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match &done.result {
            Ok(offset) => tracing::trace!("{} persisted at log offset {}", done.chunk, offset),
            Err(e) => {
                tracing::error!("Durable write of {} failed: {}", done.chunk, e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.allocator.release(done.chunk);

        let completed = self.counters.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.report_interval > 0 && completed % self.report_interval == 0 {
            tracing::info!(
                "Staging region usage {:.1}% after {} flushes",
                self.allocator.usage() * 100.0,
                completed
            );
        }
    }
}
