//! Staging Client
//!
//! Client half of the handshake. Writes go straight into the clerk's
//! chunk; only the header and key travel through the clerk's mailbox.

use std::net::ToSocketAddrs;
use std::time::Duration;

use crate::error::{Result, StageError};
use crate::protocol::{
    decode_reply, encode_record, encode_request, Op, Reply, Status, CLERK_DONE, CLIENT_DONE,
    REQUEST_HEADER_SIZE,
};
use crate::transport::tcp::TcpChannel;
use crate::transport::{Channel, SpinPolicy};

/// A connection to one clerk
///
/// ## Chunk Cursor
/// The client tracks the same cursor as its clerk: records are written at
/// `chunk_base + head`, and a write that would not fit first asks for a
/// fresh chunk with ALLOC.
pub struct StagingClient {
    channel: Box<dyn Channel>,
    policy: SpinPolicy,
    chunk_size: usize,

    /// Region-global offset of the current chunk
    chunk_base: u64,

    /// Bytes already written into the current chunk
    head: usize,
}

impl StagingClient {
    /// Wrap a connected channel and claim the first chunk
    pub fn new(channel: Box<dyn Channel>, chunk_size: usize, policy: SpinPolicy) -> Result<Self> {
        let mut client = Self {
            channel,
            policy,
            chunk_size,
            chunk_base: 0,
            head: 0,
        };
        client.alloc()?;
        Ok(client)
    }

    /// Connect over TCP
    ///
    /// `reply_timeout` bounds each wait for a reply; `None` waits forever.
    pub fn connect(addr: impl ToSocketAddrs, reply_timeout: Option<Duration>) -> Result<Self> {
        let (channel, geometry) = TcpChannel::connect(addr)?;
        tracing::debug!(
            "Connected to {}: {} chunks of {} bytes",
            channel.peer(),
            geometry.chunk_count,
            geometry.chunk_size
        );
        let policy = SpinPolicy::unbounded().with_timeout(reply_timeout);
        Self::new(Box::new(channel), geometry.chunk_size, policy)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Op::Put, key, value)
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Op::Update, key, value)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let reply = self.call(Op::Get, key)?;
        match reply.status {
            Status::Ok => Ok(Some(reply.payload)),
            Status::NotFound => Ok(None),
            Status::Error => Err(rejected(reply)),
        }
    }

    /// Delete from the backing store, returning whether the key existed there
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let reply = self.call(Op::Delete, key)?;
        match reply.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            Status::Error => Err(rejected(reply)),
        }
    }

    /// Flush the current chunk and move to a fresh one
    ///
    /// Returns the new chunk's region-global base offset.
    pub fn alloc(&mut self) -> Result<u64> {
        let reply = self.call(Op::Alloc, b"")?;
        if !reply.is_ok() {
            return Err(rejected(reply));
        }
        self.chunk_base = reply.as_chunk_base()?;
        self.head = 0;
        Ok(self.chunk_base)
    }

    /// Flush anything staged and end the connection
    pub fn close(mut self) -> Result<()> {
        let reply = self.call(Op::Close, b"")?;
        if !reply.is_ok() {
            return Err(rejected(reply));
        }
        Ok(())
    }

    /// Bytes already used in the current chunk
    pub fn head(&self) -> usize {
        self.head
    }

    pub fn chunk_base(&self) -> u64 {
        self.chunk_base
    }

    fn write(&mut self, op: Op, key: &[u8], value: &[u8]) -> Result<()> {
        let record = encode_record(op, key, value)?;
        if record.len() > self.chunk_size {
            return Err(StageError::RecordTooLarge {
                len: record.len(),
                capacity: self.chunk_size,
            });
        }
        if self.head + record.len() > self.chunk_size {
            self.alloc()?;
        }

        self.send_request(&record[..REQUEST_HEADER_SIZE + key.len()])?;
        self.channel
            .write_region(self.chunk_base + self.head as u64, &record)?;

        let reply = self.round_trip()?;
        if !reply.is_ok() {
            return Err(rejected(reply));
        }
        self.head += record.len();
        Ok(())
    }

    fn call(&mut self, op: Op, key: &[u8]) -> Result<Reply> {
        let request = encode_request(op, key, 0)?;
        self.send_request(&request)?;
        self.round_trip()
    }

    /// Place header + key in the clerk's mailbox
    ///
    /// Both mailboxes have the same size, so the local one gives the limit.
    fn send_request(&mut self, request: &[u8]) -> Result<()> {
        let capacity = self.channel.mailbox().capacity();
        if request.len() > capacity {
            return Err(StageError::RecordTooLarge {
                len: request.len(),
                capacity,
            });
        }
        self.channel.write_message(0, request)
    }

    /// Signal the clerk and wait for its reply
    fn round_trip(&mut self) -> Result<Reply> {
        self.channel.signal(CLIENT_DONE)?;
        let mailbox = self.channel.mailbox();
        mailbox.wait_for(CLERK_DONE, &self.policy)?;
        mailbox.flag().store(CLIENT_DONE);
        mailbox.read(decode_reply)
    }
}

fn rejected(reply: Reply) -> StageError {
    StageError::Rejected(String::from_utf8_lossy(&reply.payload).into_owned())
}
