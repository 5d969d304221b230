//! Handshake flag
//!
//! One-word sentinel the two ends of a connection ping-pong through.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use crate::error::{Result, StageError};

/// A handshake sentinel word
///
/// `store` publishes with Release ordering and `load` observes with
/// Acquire ordering, so every mailbox write made before a `store` is
/// visible to the side that sees the new value.
#[derive(Debug)]
pub struct HandshakeFlag(AtomicU32);

impl HandshakeFlag {
    pub fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}

/// Bounds on a busy-wait
#[derive(Debug, Clone, Default)]
pub struct SpinPolicy {
    /// Give up after this long
    pub timeout: Option<Duration>,

    /// Give up once this flag is raised
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SpinPolicy {
    /// Spin forever
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Spin until `flag` reads `expected`
///
/// `closed` reports a dead peer; it is checked between probes so a
/// vanished peer ends the wait instead of spinning forever.
pub(crate) fn wait_for(
    flag: &HandshakeFlag,
    expected: u32,
    policy: &SpinPolicy,
    closed: &AtomicBool,
) -> Result<()> {
    let started = Instant::now();
    let backoff = Backoff::new();

    loop {
        if flag.load() == expected {
            return Ok(());
        }
        if closed.load(Ordering::Acquire) {
            // The last frames may have landed right before the close.
            if flag.load() == expected {
                return Ok(());
            }
            return Err(StageError::Disconnected("peer closed the channel".to_string()));
        }
        if policy.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        if let Some(timeout) = policy.timeout {
            if started.elapsed() >= timeout {
                return Err(StageError::HandshakeTimeout(timeout.as_millis() as u64));
            }
        }
        backoff.snooze();
    }
}
