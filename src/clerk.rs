//! Clerk Module
//!
//! Server-side half of one connection: waits for a request, serves it,
//! replies, and repeats until CLOSE.
//!
//! ## Handshake
//! ```text
//!   client                                    clerk
//!     │ write_message(header + key)             │
//!     │ write_region(record)   (PUT/UPDATE)     │
//!     │ signal(CLIENT_DONE) ──────────────────▶ │ flag == CLIENT_DONE
//!     │                                         │ flag := CLERK_DONE
//!     │                                         │ process
//!     │ ◀────────────────────── write_message(reply)
//!     │ flag == CLERK_DONE ◀──── signal(CLERK_DONE)
//!     │ flag := CLIENT_DONE                     │
//! ```
//! Exactly one request is outstanding per connection.

use std::sync::Arc;

use crate::arena::ChunkId;
use crate::engine::Engine;
use crate::error::{Result, StageError};
use crate::index::Location;
use crate::protocol::{
    decode_request, encode_reply, Op, Reply, Request, CLERK_DONE, CLIENT_DONE,
    REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE,
};
use crate::store::BatchEntry;
use crate::transport::{Channel, SpinPolicy};

/// Where a clerk is in its request loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClerkState {
    AwaitingRequest,
    Processing,
    Closed,
}

/// Per-connection protocol worker
pub struct Clerk {
    id: u64,
    channel: Box<dyn Channel>,
    engine: Arc<Engine>,
    policy: SpinPolicy,
    state: ClerkState,

    /// Chunk currently being filled by the client
    chunk: Option<ChunkId>,

    /// Bytes of `chunk` already holding staged records
    cursor: usize,

    /// Records staged in `chunk` since the last flush
    pending: Vec<BatchEntry>,
}

impl Clerk {
    pub fn new(id: u64, channel: Box<dyn Channel>, engine: Arc<Engine>, policy: SpinPolicy) -> Self {
        Self {
            id,
            channel,
            engine,
            policy,
            state: ClerkState::AwaitingRequest,
            chunk: None,
            cursor: 0,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ClerkState {
        self.state
    }

    /// Serve requests until CLOSE or a connection failure
    ///
    /// On failure the pending batch is flushed best-effort before the
    /// error is returned.
    pub fn run(mut self) -> Result<()> {
        tracing::debug!("Clerk {} serving {}", self.id, self.channel.peer());
        let result = self.serve();
        match &result {
            Ok(()) => {
                tracing::debug!("Clerk {} closed by {}", self.id, self.channel.peer());
                // Still holding a chunk means the CLOSE flush failed.
                if self.chunk.is_some() {
                    self.abandon();
                }
            }
            Err(e) => {
                tracing::warn!("Clerk {} lost {}: {}", self.id, self.channel.peer(), e);
                self.abandon();
            }
        }
        self.state = ClerkState::Closed;
        result
    }

    fn serve(&mut self) -> Result<()> {
        while self.state != ClerkState::Closed {
            self.state = ClerkState::AwaitingRequest;
            self.channel.mailbox().wait_for(CLIENT_DONE, &self.policy)?;
            // Re-arm before processing so the next request can be admitted.
            self.channel.mailbox().flag().store(CLERK_DONE);

            self.state = ClerkState::Processing;
            let reply = match self.channel.mailbox().read(decode_request) {
                Ok(request) => self.handle(request),
                Err(e) => {
                    tracing::warn!("Clerk {} got a malformed request: {}", self.id, e);
                    Reply::error(&e.to_string())
                }
            };
            self.reply(reply)?;
        }
        Ok(())
    }

    fn handle(&mut self, request: Request) -> Reply {
        tracing::trace!(
            "Clerk {} {:?} key_len={} val_len={}",
            self.id,
            request.op(),
            request.header.key_len,
            request.header.val_len
        );
        match request.op() {
            Op::Put | Op::Update => self.stage(request),
            Op::Get => self.get(&request.key),
            Op::Delete => match self.engine.delete(&request.key) {
                Ok(true) => Reply::ack(),
                Ok(false) => Reply::not_found(),
                Err(e) => Reply::error(&e.to_string()),
            },
            Op::Alloc => self.alloc(),
            Op::Close => self.close(),
        }
    }

    /// Record a write the client already placed at the cursor
    fn stage(&mut self, request: Request) -> Reply {
        let Some(chunk) = self.chunk else {
            return Reply::error("no chunk allocated; send ALLOC first");
        };
        let record_len = request.header.record_len();
        if self.cursor + record_len > self.engine.arena().chunk_size() {
            return Reply::error(&format!(
                "record of {} bytes does not fit at offset {} of {}",
                record_len, self.cursor, chunk
            ));
        }

        let location = Location::InMemory {
            chunk,
            offset: (self.cursor + REQUEST_HEADER_SIZE) as u32,
            key_len: request.header.key_len,
            val_len: request.header.val_len,
        };
        self.engine.stage(request.key.clone(), location);
        self.pending.push(BatchEntry::new(request.key, location.persisted()));
        self.cursor += record_len;
        Reply::ack()
    }

    fn get(&self, key: &[u8]) -> Reply {
        match self.engine.get(key) {
            Ok(Some(value)) if value.len() > self.reply_capacity() => Reply::error(&format!(
                "value of {} bytes exceeds reply buffer",
                value.len()
            )),
            Ok(Some(value)) => Reply::ok(value),
            Ok(None) => Reply::not_found(),
            Err(e) => Reply::error(&e.to_string()),
        }
    }

    /// Flush the current chunk if it holds records, then take a fresh one
    fn alloc(&mut self) -> Reply {
        if let Some(chunk) = self.chunk {
            if let Err(e) = self.retire(chunk) {
                return Reply::error(&e.to_string());
            }
        }

        let chunk = self.engine.acquire_chunk();
        self.chunk = Some(chunk);
        self.cursor = 0;
        tracing::trace!("Clerk {} now fills {}", self.id, chunk);
        Reply::chunk_base(self.engine.chunk_base(chunk))
    }

    fn close(&mut self) -> Reply {
        self.state = ClerkState::Closed;
        match self.chunk {
            Some(chunk) => match self.retire(chunk) {
                Ok(()) => Reply::ack(),
                Err(e) => {
                    tracing::error!(
                        "Clerk {} could not flush {} on close; its records stay staged: {}",
                        self.id,
                        chunk,
                        e
                    );
                    Reply::error(&e.to_string())
                }
            },
            None => Reply::ack(),
        }
    }

    /// Give up `chunk`: flush it when it holds records, release it otherwise
    fn retire(&mut self, chunk: ChunkId) -> Result<()> {
        if self.pending.is_empty() {
            self.engine.release_chunk(chunk);
        } else {
            self.engine.flush_chunk(chunk, self.cursor, &self.pending)?;
            self.pending.clear();
        }
        self.chunk = None;
        self.cursor = 0;
        Ok(())
    }

    /// Best-effort cleanup after the connection failed
    fn abandon(&mut self) {
        if let Some(chunk) = self.chunk {
            let staged = self.pending.len();
            if let Err(e) = self.retire(chunk) {
                // The chunk stays allocated: the staged entries still point into it.
                tracing::error!(
                    "Clerk {} left {} staged records unflushed in {}: {}",
                    self.id,
                    staged,
                    chunk,
                    e
                );
            }
        }
    }

    fn reply(&mut self, mut reply: Reply) -> Result<()> {
        let capacity = self.reply_capacity();
        if reply.payload.len() > capacity {
            // Only ERROR text can get here; GET values are checked earlier.
            reply.payload.truncate(capacity);
        }
        let bytes = encode_reply(&reply);
        self.channel.write_message(0, &bytes)?;
        self.channel.signal(CLERK_DONE)
    }

    /// Largest reply payload the client's mailbox can hold
    ///
    /// Both ends use the same message size, so the local mailbox stands in
    /// for the client's.
    fn reply_capacity(&self) -> usize {
        self.channel.mailbox().capacity().saturating_sub(REPLY_HEADER_SIZE)
    }
}

impl std::fmt::Debug for Clerk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clerk")
            .field("id", &self.id)
            .field("peer", &self.channel.peer())
            .field("state", &self.state)
            .field("chunk", &self.chunk)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Whether a clerk ended because of shutdown or a departed client
pub fn is_routine_exit(error: &StageError) -> bool {
    matches!(error, StageError::Cancelled | StageError::Disconnected(_))
}
