//! Backing Store Module
//!
//! The key/value engine of record that flushed chunks land in.
//!
//! ## Responsibilities
//! - Point get/put/update/delete from any clerk thread
//! - Batch insert of a whole flushed chunk in one call
//!
//! ## Implementations
//! - [`MemoryStore`]: sharded in-memory hash map
//! - [`LogStore`]: append-only data file with CRC-framed records and an
//!   in-memory key index rebuilt on open

mod memory;
mod log_store;

pub use memory::MemoryStore;
pub use log_store::{LogStore, RecoveryResult};

use crate::error::{Result, StageError};
use crate::index::Location;

/// One staged record handed to [`BackingStore::put_batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub key: Vec<u8>,

    /// Position of the record inside the batch buffer
    pub location: Location,
}

impl BatchEntry {
    pub fn new(key: Vec<u8>, location: Location) -> Self {
        Self { key, location }
    }

    /// Slice this entry's value out of the batch buffer
    pub fn value<'a>(&self, buffer: &'a [u8]) -> Result<&'a [u8]> {
        let range = self.location.value_range();
        buffer.get(range.clone()).ok_or_else(|| {
            StageError::Store(format!(
                "value at {:?} lies outside batch buffer of {} bytes",
                range,
                buffer.len()
            ))
        })
    }
}

/// Capability set required of the engine of record
///
/// Implementations must tolerate concurrent calls from many clerks.
pub trait BackingStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value)
    }

    /// Delete `key`, returning whether it existed
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Insert every entry, reading values out of `buffer`
    fn put_batch(&self, batch: &[BatchEntry], buffer: &[u8]) -> Result<()>;

    /// Engine name for diagnostics
    fn name(&self) -> &'static str;
}
