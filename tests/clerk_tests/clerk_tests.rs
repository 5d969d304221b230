//! Tests for the Clerk protocol state machine
//!
//! These tests verify:
//! - Read-your-write through the staging index
//! - ALLOC and CLOSE flush the pending batch into the backing store
//! - Implicit ALLOC when a record does not fit
//! - DELETE leaves staged writes visible
//! - Error replies for requests the clerk cannot serve
//! - Cleanup when a connection fails or times out
//! - Backing store failures surface as ERROR replies
//! - Listener limits and shutdown over loopback channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use stagekv::clerk::Clerk;
use stagekv::protocol::{
    decode_reply, encode_request, Op, Reply, Status, CLERK_DONE, CLIENT_DONE,
};
use stagekv::store::{BackingStore, BatchEntry, MemoryStore};
use stagekv::transport::loopback::{self, LoopbackChannel};
use stagekv::transport::{Channel, SpinPolicy};
use stagekv::{Config, Engine, Server, StageError, StagingClient};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp.path())
        .listen_addr("127.0.0.1:0")
        .chunk_size(1024)
        .chunk_count(8)
        .message_size(256)
        .io_queue_depth(4)
        .log_capacity(64 * 1024)
        .build()
}

fn open_engine(config: Config) -> Arc<Engine> {
    Arc::new(Engine::open(config, Arc::new(MemoryStore::new())).unwrap())
}

fn reply_policy() -> SpinPolicy {
    SpinPolicy::unbounded().with_timeout(Some(Duration::from_secs(5)))
}

/// Start a clerk on its own thread and connect a client to it
fn connect(engine: &Arc<Engine>, policy: SpinPolicy) -> (StagingClient, JoinHandle<stagekv::Result<()>>) {
    let (clerk_end, client_end) =
        loopback::pair(Arc::clone(engine.arena()), engine.config().message_size);
    let clerk = Clerk::new(0, Box::new(clerk_end), Arc::clone(engine), policy);
    let handle = thread::spawn(move || clerk.run());
    let client =
        StagingClient::new(Box::new(client_end), engine.config().chunk_size, reply_policy()).unwrap();
    (client, handle)
}

/// Start a clerk and return the raw client end of its channel
fn connect_raw(engine: &Arc<Engine>) -> (LoopbackChannel, JoinHandle<stagekv::Result<()>>) {
    let (clerk_end, client_end) =
        loopback::pair(Arc::clone(engine.arena()), engine.config().message_size);
    let clerk = Clerk::new(0, Box::new(clerk_end), Arc::clone(engine), SpinPolicy::unbounded());
    (client_end, thread::spawn(move || clerk.run()))
}

/// One handshake round trip with hand-built request bytes
fn raw_call(channel: &mut LoopbackChannel, request: &[u8]) -> Reply {
    channel.write_message(0, request).unwrap();
    channel.signal(CLIENT_DONE).unwrap();
    channel.mailbox().wait_for(CLERK_DONE, &reply_policy()).unwrap();
    channel.mailbox().flag().store(CLIENT_DONE);
    channel.mailbox().read(decode_reply).unwrap()
}

/// Memory store that fails the next N calls
struct FailingStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(0),
        }
    }

    fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> stagekv::Result<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StageError::Store("injected failure".to_string()));
        }
        Ok(())
    }
}

impl BackingStore for FailingStore {
    fn put(&self, key: &[u8], value: &[u8]) -> stagekv::Result<()> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> stagekv::Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key)
    }

    fn delete(&self, key: &[u8]) -> stagekv::Result<bool> {
        self.check()?;
        self.inner.delete(key)
    }

    fn put_batch(&self, batch: &[BatchEntry], buffer: &[u8]) -> stagekv::Result<()> {
        self.check()?;
        self.inner.put_batch(batch, buffer)
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

fn open_failing_engine(temp: &TempDir) -> (Arc<FailingStore>, Arc<Engine>) {
    let store = Arc::new(FailingStore::new());
    let engine = Engine::open(test_config(temp), store.clone()).unwrap();
    (store, Arc::new(engine))
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Read/Write Tests
// =============================================================================

#[test]
fn test_read_your_write_before_flush() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"a", b"1").unwrap();
    assert_eq!(client.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert!(engine.index().contains(b"a"));
    assert_eq!(engine.store().get(b"a").unwrap(), None);

    client.update(b"a", b"2").unwrap();
    assert_eq!(client.get(b"a").unwrap(), Some(b"2".to_vec()));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_get_missing_key() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    assert_eq!(client.get(b"missing").unwrap(), None);
    assert!(!client.delete(b"missing").unwrap());

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_alloc_flushes_batch_to_store() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"a", b"1").unwrap();
    client.put(b"b", b"2").unwrap();
    client.alloc().unwrap();

    assert_eq!(engine.store().get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.store().get(b"b").unwrap(), Some(b"2".to_vec()));
    assert!(!engine.index().contains(b"a"));
    assert!(!engine.index().contains(b"b"));
    assert_eq!(client.get(b"a").unwrap(), Some(b"1".to_vec()));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_close_flushes_every_pending_key_once() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    const M: usize = 20;
    for i in 0..M {
        client.put(format!("key{:02}", i).as_bytes(), b"v").unwrap();
    }
    client.close().unwrap();
    clerk.join().unwrap().unwrap();

    for i in 0..M {
        let key = format!("key{:02}", i);
        assert_eq!(engine.store().get(key.as_bytes()).unwrap(), Some(b"v".to_vec()));
    }
    assert!(engine.index().is_empty());

    let stats = engine.shutdown().unwrap();
    assert_eq!(stats.submitted, 1);
    assert_eq!(engine.usage(), 0.0);
}

#[test]
fn test_implicit_alloc_when_chunk_is_full() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .chunk_size(64)
        .chunk_count(4)
        .log_capacity(4096)
        .build();
    let engine = open_engine(config);
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    // Each record is 8 + 2 + 20 = 30 bytes; two fit in a 64 byte chunk.
    let value = [b'x'; 20];
    client.put(b"k1", &value).unwrap();
    client.put(b"k2", &value).unwrap();
    assert_eq!(client.head(), 60);

    client.put(b"k3", &value).unwrap();
    assert_eq!(client.head(), 30);

    assert_eq!(engine.store().get(b"k1").unwrap(), Some(value.to_vec()));
    assert_eq!(engine.store().get(b"k2").unwrap(), Some(value.to_vec()));
    assert!(engine.index().contains(b"k3"));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_record_larger_than_chunk_is_rejected() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    let result = client.put(b"big", &[0u8; 2048]);
    assert!(matches!(result, Err(StageError::RecordTooLarge { capacity: 1024, .. })));

    // The connection is still usable.
    client.put(b"small", b"ok").unwrap();
    assert_eq!(client.get(b"small").unwrap(), Some(b"ok".to_vec()));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_empty_key() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    assert_eq!(client.get(b"").unwrap(), None);
    client.put(b"", b"nothing").unwrap();
    assert_eq!(client.get(b"").unwrap(), Some(b"nothing".to_vec()));
    client.alloc().unwrap();
    assert!(client.delete(b"").unwrap());
    assert_eq!(client.get(b"").unwrap(), None);

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_delete_does_not_touch_staged_write() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"k", b"old").unwrap();
    client.alloc().unwrap();
    client.put(b"k", b"new").unwrap();

    // DELETE only reaches the backing store ...
    assert!(client.delete(b"k").unwrap());
    assert_eq!(engine.store().get(b"k").unwrap(), None);

    // ... so the staged write is still served.
    assert_eq!(client.get(b"k").unwrap(), Some(b"new".to_vec()));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
    assert_eq!(engine.store().get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_alloc_without_writes_recycles_chunk() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());
    assert_eq!(engine.allocator().in_use(), 1);

    for _ in 0..10 {
        client.alloc().unwrap();
    }
    assert_eq!(engine.allocator().in_use(), 1);

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
    assert_eq!(engine.allocator().in_use(), 0);
}

#[test]
fn test_get_value_larger_than_reply_buffer() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .chunk_size(1024)
        .chunk_count(2)
        .message_size(64)
        .log_capacity(4096)
        .build();
    let engine = open_engine(config);
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"k", &[7u8; 100]).unwrap();
    assert!(matches!(client.get(b"k"), Err(StageError::Rejected(_))));

    client.close().unwrap();
    clerk.join().unwrap().unwrap();
}

// =============================================================================
// Raw Protocol Tests
// =============================================================================

#[test]
fn test_put_before_alloc_is_an_error() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut channel, clerk) = connect_raw(&engine);

    let reply = raw_call(&mut channel, &encode_request(Op::Put, b"k", 1).unwrap());
    assert_eq!(reply.status, Status::Error);
    assert!(engine.index().is_empty());

    let reply = raw_call(&mut channel, &encode_request(Op::Close, b"", 0).unwrap());
    assert_eq!(reply.status, Status::Ok);
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_overflowing_put_is_an_error() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut channel, clerk) = connect_raw(&engine);

    let reply = raw_call(&mut channel, &encode_request(Op::Alloc, b"", 0).unwrap());
    assert!(reply.is_ok());

    let reply = raw_call(&mut channel, &encode_request(Op::Put, b"k", 4096).unwrap());
    assert_eq!(reply.status, Status::Error);
    assert!(!engine.index().contains(b"k"));

    raw_call(&mut channel, &encode_request(Op::Close, b"", 0).unwrap());
    clerk.join().unwrap().unwrap();
    assert_eq!(engine.allocator().in_use(), 0);
}

#[test]
fn test_malformed_request_keeps_connection() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut channel, clerk) = connect_raw(&engine);

    let mut bogus = encode_request(Op::Get, b"k", 0).unwrap();
    bogus[0] = 0x33;
    let reply = raw_call(&mut channel, &bogus);
    assert_eq!(reply.status, Status::Error);

    let reply = raw_call(&mut channel, &encode_request(Op::Get, b"k", 0).unwrap());
    assert_eq!(reply.status, Status::NotFound);

    raw_call(&mut channel, &encode_request(Op::Close, b"", 0).unwrap());
    clerk.join().unwrap().unwrap();
}

#[test]
fn test_alloc_reply_is_chunk_base() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let held = engine.acquire_chunk();
    let (mut channel, clerk) = connect_raw(&engine);

    let reply = raw_call(&mut channel, &encode_request(Op::Alloc, b"", 0).unwrap());
    let base = reply.as_chunk_base().unwrap();
    assert_ne!(base, engine.chunk_base(held));
    assert_eq!(base % 1024, 0);

    raw_call(&mut channel, &encode_request(Op::Close, b"", 0).unwrap());
    clerk.join().unwrap().unwrap();
    engine.release_chunk(held);
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

#[test]
fn test_dropped_client_flushes_pending_batch() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"orphan", b"saved").unwrap();
    drop(client);

    let result = clerk.join().unwrap();
    assert!(matches!(result, Err(StageError::Disconnected(_))));
    assert_eq!(engine.store().get(b"orphan").unwrap(), Some(b"saved".to_vec()));
    assert!(!engine.index().contains(b"orphan"));
    wait_until("chunk release", || engine.allocator().in_use() == 0);
}

#[test]
fn test_request_timeout_releases_empty_chunk() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(test_config(&temp));
    let policy = SpinPolicy::unbounded().with_timeout(Some(Duration::from_millis(50)));
    let (mut client, clerk) = connect(&engine, policy);

    let result = clerk.join().unwrap();
    assert!(matches!(result, Err(StageError::HandshakeTimeout(50))));
    assert_eq!(engine.allocator().in_use(), 0);

    assert!(matches!(client.get(b"k"), Err(StageError::Disconnected(_))));
}

#[test]
fn test_store_failure_on_alloc_keeps_batch_staged() {
    let temp = TempDir::new().unwrap();
    let (store, engine) = open_failing_engine(&temp);
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"a", b"1").unwrap();
    client.put(b"b", b"2").unwrap();
    store.fail_next(usize::MAX);

    assert!(matches!(client.alloc(), Err(StageError::Rejected(_))));
    assert!(engine.index().contains(b"a"));
    assert!(engine.index().contains(b"b"));
    assert_eq!(engine.allocator().in_use(), 1);

    // Staged values never touch the store ...
    assert_eq!(client.get(b"a").unwrap(), Some(b"1".to_vec()));
    // ... everything else reports the failure.
    assert!(matches!(client.get(b"missing"), Err(StageError::Rejected(_))));
    assert!(matches!(client.delete(b"a"), Err(StageError::Rejected(_))));

    store.fail_next(0);
    client.close().unwrap();
    clerk.join().unwrap().unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert!(engine.index().is_empty());
}

#[test]
fn test_failed_close_flush_is_retried() {
    let temp = TempDir::new().unwrap();
    let (store, engine) = open_failing_engine(&temp);
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"late", b"still-saved").unwrap();
    store.fail_next(1);

    assert!(matches!(client.close(), Err(StageError::Rejected(_))));
    clerk.join().unwrap().unwrap();

    assert_eq!(store.get(b"late").unwrap(), Some(b"still-saved".to_vec()));
    assert!(!engine.index().contains(b"late"));
    wait_until("chunk release", || engine.allocator().in_use() == 0);
}

#[test]
fn test_unflushable_close_keeps_chunk_and_entries() {
    let temp = TempDir::new().unwrap();
    let (store, engine) = open_failing_engine(&temp);
    let (mut client, clerk) = connect(&engine, SpinPolicy::unbounded());

    client.put(b"stuck", b"v").unwrap();
    store.fail_next(usize::MAX);

    assert!(client.close().is_err());
    clerk.join().unwrap().unwrap();

    // The staged entry still points into the held chunk and stays readable.
    assert_eq!(engine.allocator().in_use(), 1);
    assert_eq!(engine.get(b"stuck").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Listener Tests
// =============================================================================

#[test]
fn test_newer_write_from_other_connection_survives_flush() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let engine = open_engine(config.clone());
    let server = Server::bind(config, Arc::clone(&engine)).unwrap();

    let mut first = server.connect_loopback().unwrap();
    let mut second = server.connect_loopback().unwrap();
    assert_eq!(server.active_clerks(), 2);

    first.put(b"k", b"first").unwrap();
    second.put(b"k", b"second").unwrap();
    first.alloc().unwrap();

    assert!(engine.index().contains(b"k"));
    assert_eq!(first.get(b"k").unwrap(), Some(b"second".to_vec()));

    first.close().unwrap();
    second.close().unwrap();
    server.join();
    assert_eq!(engine.store().get(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_connection_limit() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.max_connections = 1;
    let engine = open_engine(config.clone());
    let server = Server::bind(config, Arc::clone(&engine)).unwrap();

    let client = server.connect_loopback().unwrap();
    assert!(matches!(server.connect_loopback(), Err(StageError::Transport(_))));

    client.close().unwrap();
    wait_until("clerk exit", || server.active_clerks() == 0);
    let client = server.connect_loopback().unwrap();
    client.close().unwrap();
    server.join();
}

#[test]
fn test_shutdown_cancels_idle_clerks() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let engine = open_engine(config.clone());
    let server = Server::bind(config, Arc::clone(&engine)).unwrap();

    let mut client = server.connect_loopback().unwrap();
    client.put(b"staged", b"1").unwrap();
    assert!(server.usage() > 0.0);

    server.shutdown();
    server.join();

    assert_eq!(server.active_clerks(), 0);
    assert_eq!(engine.store().get(b"staged").unwrap(), Some(b"1".to_vec()));
    assert!(matches!(server.connect_loopback(), Err(StageError::Cancelled)));
    drop(client);
}
