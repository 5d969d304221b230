//! In-memory backing store

use dashmap::DashMap;

use super::{BackingStore, BatchEntry};
use crate::error::Result;

/// Hash-map store with no persistence
#[derive(Default)]
pub struct MemoryStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BackingStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    fn put_batch(&self, batch: &[BatchEntry], buffer: &[u8]) -> Result<()> {
        // Validate first so a bad entry leaves the store untouched.
        let values = batch
            .iter()
            .map(|entry| entry.value(buffer))
            .collect::<Result<Vec<_>>>()?;
        for (entry, value) in batch.iter().zip(values) {
            self.data.insert(entry.key.clone(), value.to_vec());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
