//! Transport Module
//!
//! Remote-memory style channels between a client and its clerk.
//!
//! ## Model
//! Each side owns a [`Mailbox`] that only the peer writes into. Every
//! exchange is:
//!
//! ```text
//! sender                                  receiver
//!   │ write_message(body)  ───────────────▶ mailbox body
//!   │ write_region(record) ───────────────▶ staging arena   (client writes only)
//!   │ signal(SENTINEL)     ───────────────▶ mailbox flag    (lands after the above)
//!   │                                       receiver spins on flag
//! ```
//!
//! Two realizations are provided:
//! - [`loopback`]: in-process, both ends share memory directly
//! - [`tcp`]: one-sided writes emulated with ordered frames on a TCP stream

mod handshake;
mod mailbox;
pub mod loopback;
pub mod tcp;

pub use handshake::{HandshakeFlag, SpinPolicy};
pub use mailbox::Mailbox;

use crate::error::Result;

/// One end of a connected channel
pub trait Channel: Send {
    /// The mailbox the peer writes into
    fn mailbox(&self) -> &Mailbox;

    /// One-sided write into the peer's mailbox body at `offset`
    fn write_message(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// One-sided write into the peer's staging region at a region-global offset
    fn write_region(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Store `value` into the peer's handshake flag
    ///
    /// Returns once the store has completed; every earlier write on this
    /// channel is visible to the peer before the new flag value is.
    fn signal(&mut self, value: u32) -> Result<()>;

    /// Human-readable peer name for logging
    fn peer(&self) -> &str;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn mailbox(&self) -> &Mailbox {
        (**self).mailbox()
    }

    fn write_message(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        (**self).write_message(offset, bytes)
    }

    fn write_region(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        (**self).write_region(offset, bytes)
    }

    fn signal(&mut self, value: u32) -> Result<()> {
        (**self).signal(value)
    }

    fn peer(&self) -> &str {
        (**self).peer()
    }
}
