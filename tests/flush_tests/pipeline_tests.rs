//! Tests for the Durable Flush Pipeline
//!
//! These tests verify:
//! - A slot is released only after its write completion is observed
//! - In-flight writes never exceed the configured depth
//! - Shutdown drains queued and in-flight work
//! - The ring log wraps to offset 0 at capacity
//! - Engine flushes commit to the store before logging
//! - Staged reads never observe a recycled chunk

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use stagekv::alloc::ChunkAllocator;
use stagekv::arena::{ChunkArena, ChunkId};
use stagekv::flush::{DurableLog, FlushJob, FlushPipeline, LogCompletion, RingLog};
use stagekv::index::Location;
use stagekv::protocol::{encode_record, Op, REQUEST_HEADER_SIZE};
use stagekv::store::{BatchEntry, MemoryStore};
use stagekv::{Config, Engine, StageError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Durable log whose writes complete only when the test says so
struct ManualLog {
    submitted: Mutex<Vec<FlushJob>>,
    done_tx: Sender<LogCompletion>,
    done_rx: Receiver<LogCompletion>,
}

impl ManualLog {
    fn new() -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            submitted: Mutex::new(Vec::new()),
            done_tx,
            done_rx,
        }
    }

    fn submitted(&self) -> Vec<FlushJob> {
        self.submitted.lock().clone()
    }

    fn complete(&self, chunk: ChunkId) {
        self.done_tx
            .send(LogCompletion { chunk, result: Ok(0) })
            .unwrap();
    }

    fn fail(&self, chunk: ChunkId) {
        self.done_tx
            .send(LogCompletion {
                chunk,
                result: Err(StageError::Store("disk on fire".to_string())),
            })
            .unwrap();
    }
}

impl DurableLog for ManualLog {
    fn submit(&self, job: FlushJob) -> stagekv::Result<()> {
        self.submitted.lock().push(job);
        Ok(())
    }

    fn completions(&self) -> &Receiver<LogCompletion> {
        &self.done_rx
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Pipeline Tests
// =============================================================================

#[test]
fn test_slot_not_released_before_completion() {
    let allocator = Arc::new(ChunkAllocator::new(1));
    let log = Arc::new(ManualLog::new());
    let pipeline = FlushPipeline::start(log.clone(), Arc::clone(&allocator), 4, 0).unwrap();

    let chunk = allocator.acquire();
    pipeline.enqueue(FlushJob { chunk, len: 128 }).unwrap();
    wait_until("submission", || log.submitted().len() == 1);

    // Write is stalled: the slot must stay unavailable.
    thread::sleep(Duration::from_millis(50));
    assert!(allocator.is_allocated(chunk));
    assert!(allocator.try_acquire().is_none());

    log.complete(chunk);
    wait_until("release", || !allocator.is_allocated(chunk));
    assert_eq!(allocator.try_acquire(), Some(chunk));

    pipeline.shutdown().unwrap();
}

#[test]
fn test_in_flight_window_is_bounded() {
    let allocator = Arc::new(ChunkAllocator::new(8));
    let log = Arc::new(ManualLog::new());
    let pipeline = FlushPipeline::start(log.clone(), Arc::clone(&allocator), 2, 0).unwrap();

    let chunks: Vec<_> = (0..5).map(|_| allocator.acquire()).collect();
    for &chunk in &chunks {
        pipeline.enqueue(FlushJob { chunk, len: 64 }).unwrap();
    }

    wait_until("first window", || log.submitted().len() == 2);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(log.submitted().len(), 2);

    log.complete(chunks[0]);
    wait_until("window to slide", || log.submitted().len() == 3);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(log.submitted().len(), 3);

    for job in log.submitted().iter().skip(1) {
        log.complete(job.chunk);
    }
    wait_until("remaining submissions", || log.submitted().len() == 5);
    for job in log.submitted().iter().skip(3) {
        log.complete(job.chunk);
    }

    let stats = pipeline.shutdown().unwrap();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(allocator.in_use(), 0);
}

#[test]
fn test_failed_write_is_counted_and_slot_released() {
    let allocator = Arc::new(ChunkAllocator::new(2));
    let log = Arc::new(ManualLog::new());
    let pipeline = FlushPipeline::start(log.clone(), Arc::clone(&allocator), 2, 0).unwrap();

    let chunk = allocator.acquire();
    pipeline.enqueue(FlushJob { chunk, len: 16 }).unwrap();
    wait_until("submission", || log.submitted().len() == 1);
    log.fail(chunk);

    wait_until("release", || !allocator.is_allocated(chunk));
    let stats = pipeline.shutdown().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_shutdown_waits_for_in_flight_writes() {
    let allocator = Arc::new(ChunkAllocator::new(4));
    let log = Arc::new(ManualLog::new());
    let pipeline = Arc::new(
        FlushPipeline::start(log.clone(), Arc::clone(&allocator), 1, 0).unwrap(),
    );

    let a = allocator.acquire();
    let b = allocator.acquire();
    pipeline.enqueue(FlushJob { chunk: a, len: 8 }).unwrap();
    pipeline.enqueue(FlushJob { chunk: b, len: 8 }).unwrap();

    let stopper = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.shutdown().unwrap())
    };

    wait_until("first submission", || log.submitted().len() == 1);
    log.complete(a);
    wait_until("queued job to be submitted", || log.submitted().len() == 2);
    assert!(!stopper.is_finished());
    log.complete(b);

    let stats = stopper.join().unwrap();
    assert_eq!(stats.completed, 2);
    assert!(matches!(
        pipeline.enqueue(FlushJob { chunk: a, len: 8 }),
        Err(StageError::PipelineClosed)
    ));
}

// =============================================================================
// Ring Log Tests
// =============================================================================

#[test]
fn test_ring_log_wraps_to_start() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("ring.log");
    let arena = Arc::new(ChunkArena::new(64, 3));
    for (i, fill) in [b'A', b'B', b'C'].into_iter().enumerate() {
        arena.write(ChunkId::new(i), 0, &[fill; 48]).unwrap();
    }

    let log = RingLog::open(&path, 128, 2, false, Arc::clone(&arena)).unwrap();
    let mut offsets = Vec::new();
    for i in 0..3 {
        log.submit(FlushJob { chunk: ChunkId::new(i), len: 48 }).unwrap();
        offsets.push(log.completions().recv().unwrap().result.unwrap());
    }
    assert_eq!(offsets, vec![0, 48, 0]);
    assert_eq!(log.next_offset(), 48);
    drop(log);

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(contents.len(), 128);
    assert!(contents[..48].iter().all(|&b| b == b'C'));
    assert!(contents[48..96].iter().all(|&b| b == b'B'));
}

#[test]
fn test_ring_log_rejects_write_larger_than_capacity() {
    let temp = TempDir::new().unwrap();
    let arena = Arc::new(ChunkArena::new(256, 1));
    let log = RingLog::open(&temp.path().join("ring.log"), 128, 1, false, arena).unwrap();

    let result = log.submit(FlushJob { chunk: ChunkId::new(0), len: 200 });
    assert!(matches!(result, Err(StageError::LogCapacity { len: 200, capacity: 128 })));
}

// =============================================================================
// Engine Flush Tests
// =============================================================================

#[test]
fn test_engine_flush_holds_chunk_until_logged() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .chunk_size(128)
        .chunk_count(1)
        .log_capacity(1024)
        .build();
    let log = Arc::new(ManualLog::new());
    let engine = Engine::with_log(config, Arc::new(MemoryStore::new()), log.clone()).unwrap();

    let chunk = engine.acquire_chunk();
    let record = encode_record(Op::Put, b"k", b"v").unwrap();
    engine.arena().write(chunk, 0, &record).unwrap();
    let location = Location::InMemory {
        chunk,
        offset: REQUEST_HEADER_SIZE as u32,
        key_len: 1,
        val_len: 1,
    };
    engine.stage(b"k".to_vec(), location);

    let batch = vec![BatchEntry::new(b"k".to_vec(), location.persisted())];
    engine.flush_chunk(chunk, record.len(), &batch).unwrap();

    // Committed and unstaged right away, recycled only after the log write.
    assert_eq!(engine.store().get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(!engine.index().contains(b"k"));
    wait_until("submission", || log.submitted().len() == 1);
    assert_eq!(log.submitted()[0], FlushJob { chunk, len: record.len() });
    assert!(engine.allocator().try_acquire().is_none());

    log.complete(chunk);
    wait_until("release", || engine.usage() == 0.0);
    engine.shutdown().unwrap();
}

#[test]
fn test_staged_read_never_sees_recycled_chunk() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .chunk_size(128)
        .chunk_count(1)
        .io_queue_depth(1)
        .log_capacity(4096)
        .build();
    let engine = Arc::new(Engine::open(config, Arc::new(MemoryStore::new())).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    // "k" and "z" records have the same layout, so they land on the same bytes.
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if let Some(value) = engine.get(b"k").unwrap() {
                        assert!(value.iter().all(|&b| b == b'A'), "read {:?}", value);
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    for round in 0..200 {
        let (key, fill) = if round % 2 == 0 { (b"k", b'A') } else { (b"z", b'Z') };
        let chunk = loop {
            if let Some(chunk) = engine.allocator().try_acquire() {
                break chunk;
            }
            thread::yield_now();
        };
        let record = encode_record(Op::Put, key, &[fill; 32]).unwrap();
        engine.arena().write(chunk, 0, &record).unwrap();
        let location = Location::InMemory {
            chunk,
            offset: REQUEST_HEADER_SIZE as u32,
            key_len: 1,
            val_len: 32,
        };
        engine.stage(key.to_vec(), location);
        let batch = vec![BatchEntry::new(key.to_vec(), location.persisted())];
        engine.flush_chunk(chunk, record.len(), &batch).unwrap();
    }

    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(engine.get(b"k").unwrap(), Some(vec![b'A'; 32]));
    engine.shutdown().unwrap();
}
