//! Mailbox
//!
//! Small fixed-capacity per-connection buffer the peer writes into.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::handshake::{self, HandshakeFlag, SpinPolicy};
use crate::error::{Result, StageError};

/// A registered request/reply buffer
///
/// ```text
/// ┌────────────────────┬──────────────────────────────┐
/// │ Flag (2 words)     │ Body (message_size - 8)      │
/// └────────────────────┴──────────────────────────────┘
/// ```
pub struct Mailbox {
    flag: HandshakeFlag,
    body: Mutex<Box<[u8]>>,
    closed: AtomicBool,
}

impl Mailbox {
    /// Bytes reserved in front of the body for the handshake words
    pub const FLAG_SIZE: usize = 8;

    /// Create a mailbox of `message_size` bytes whose flag starts at `initial`
    pub fn new(message_size: usize, initial: u32) -> Self {
        let body_len = message_size.saturating_sub(Self::FLAG_SIZE);
        Self {
            flag: HandshakeFlag::new(initial),
            body: Mutex::new(vec![0u8; body_len].into_boxed_slice()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn flag(&self) -> &HandshakeFlag {
        &self.flag
    }

    /// Usable body capacity
    pub fn capacity(&self) -> usize {
        self.body.lock().len()
    }

    /// Write into the body at `offset`
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut body = self.body.lock();
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= body.len())
            .ok_or_else(|| {
                StageError::OutOfBounds(format!(
                    "{} bytes at offset {} exceed mailbox of {} bytes",
                    bytes.len(),
                    offset,
                    body.len()
                ))
            })?;
        body[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Run `f` over the body
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.body.lock())
    }

    /// Spin until the flag reads `expected`
    pub fn wait_for(&self, expected: u32, policy: &SpinPolicy) -> Result<()> {
        handshake::wait_for(&self.flag, expected, policy, &self.closed)
    }

    /// Mark the peer as gone; waiters fail with `Disconnected`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
