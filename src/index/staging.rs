//! Staging index implementation
//!
//! DashMap-backed map shared by all clerks.

use dashmap::DashMap;

use super::Location;

/// Concurrent key → location map for writes not yet in the backing store
///
/// Identical-key races resolve last-writer-wins; each connection's own
/// writes are already serialized by the request/reply protocol.
pub struct StagingIndex {
    entries: DashMap<Vec<u8>, Location>,
}

impl StagingIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or overwrite, returning the previous location
    pub fn insert(&self, key: Vec<u8>, location: Location) -> Option<Location> {
        self.entries.insert(key, location)
    }

    pub fn find(&self, key: &[u8]) -> Option<Location> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Run `f` on the entry for `key` while it is pinned
    ///
    /// The entry cannot be erased until `f` returns.
    pub fn with_entry<R>(&self, key: &[u8], f: impl FnOnce(&Location) -> R) -> Option<R> {
        self.entries.get(key).map(|entry| f(entry.value()))
    }

    pub fn erase(&self, key: &[u8]) -> Option<Location> {
        self.entries.remove(key).map(|(_, location)| location)
    }

    /// Erase `key` only while it still points at `expected`
    ///
    /// A newer write to the same key from another connection survives.
    pub fn erase_if(&self, key: &[u8], expected: &Location) -> bool {
        self.entries
            .remove_if(key, |_, current| current == expected)
            .is_some()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StagingIndex {
    fn default() -> Self {
        Self::new()
    }
}
