//! Loopback channel
//!
//! In-process channel pair; remote writes are plain shared-memory writes.

use std::sync::Arc;

use super::{Channel, Mailbox};
use crate::arena::ChunkArena;
use crate::error::{Result, StageError};
use crate::protocol::{CLERK_DONE, CLIENT_DONE};

/// One end of an in-process channel
pub struct LoopbackChannel {
    local: Arc<Mailbox>,
    remote: Arc<Mailbox>,
    /// The peer's staging region, present on the client end only
    remote_region: Option<Arc<ChunkArena>>,
    peer: String,
}

/// Connect a clerk end and a client end over `arena`
///
/// Returns `(clerk_end, client_end)`.
pub fn pair(arena: Arc<ChunkArena>, message_size: usize) -> (LoopbackChannel, LoopbackChannel) {
    let clerk_box = Arc::new(Mailbox::new(message_size, CLERK_DONE));
    let client_box = Arc::new(Mailbox::new(message_size, CLIENT_DONE));

    let clerk_end = LoopbackChannel {
        local: Arc::clone(&clerk_box),
        remote: Arc::clone(&client_box),
        remote_region: None,
        peer: "loopback-client".to_string(),
    };
    let client_end = LoopbackChannel {
        local: client_box,
        remote: clerk_box,
        remote_region: Some(arena),
        peer: "loopback-clerk".to_string(),
    };
    (clerk_end, client_end)
}

impl Channel for LoopbackChannel {
    fn mailbox(&self) -> &Mailbox {
        &self.local
    }

    fn write_message(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.remote.write(offset, bytes)
    }

    fn write_region(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match &self.remote_region {
            Some(arena) => arena.write_at(offset, bytes),
            None => Err(StageError::Transport(format!(
                "{} exposes no staging region",
                self.peer
            ))),
        }
    }

    fn signal(&mut self, value: u32) -> Result<()> {
        // The peer closes our mailbox when it goes away.
        if self.local.is_closed() {
            return Err(StageError::Disconnected(self.peer.clone()));
        }
        self.remote.flag().store(value);
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.remote.close();
    }
}
