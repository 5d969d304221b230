//! Log-structured backing store
//!
//! Append-only data file plus an in-memory index of the latest value
//! offset for every live key.
//!
//! ## Record Format
//! ```text
//! ┌───────────┬────────────┬────────────┬──────┬─────────┐
//! │ CRC32 (4) │ KeyLen (4) │ ValLen (4) │ Key  │ Value   │
//! └───────────┴────────────┴────────────┴──────┴─────────┘
//! ```
//! - CRC covers everything after itself
//! - ValLen = u32::MAX marks a tombstone (no value bytes)
//! - A torn or corrupt tail is truncated on open

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::{BackingStore, BatchEntry};
use crate::error::{Result, StageError};

/// Record header: CRC (4) + KeyLen (4) + ValLen (4)
const RECORD_HEADER_SIZE: usize = 12;

/// Sentinel value length marking a deleted key
const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Where a live value sits in the data file
#[derive(Debug, Clone, Copy)]
struct ValuePointer {
    offset: u64,
    len: u32,
}

/// Outcome of replaying the data file on open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Records replayed into the index
    pub records_recovered: u64,

    /// Bytes cut off the end of the file
    pub bytes_truncated: u64,
}

/// Persistent append-only store
pub struct LogStore {
    path: PathBuf,
    file: File,
    /// Next append offset; holding the lock serializes writers
    tail: Mutex<u64>,
    index: RwLock<HashMap<Vec<u8>, ValuePointer>>,
    sync: bool,
    recovery: RecoveryResult,
}

impl LogStore {
    /// Open or create the data file at `path`, replaying existing records
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let (index, tail, recovery) = Self::replay(&file)?;
        if recovery.bytes_truncated > 0 {
            tracing::warn!(
                "Truncated {} corrupt bytes from {}",
                recovery.bytes_truncated,
                path.display()
            );
            file.set_len(tail)?;
            file.sync_all()?;
        }
        tracing::debug!(
            "Opened log store {} ({} records, {} live keys)",
            path.display(),
            recovery.records_recovered,
            index.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            tail: Mutex::new(tail),
            index: RwLock::new(index),
            sync,
            recovery,
        })
    }

    /// Rebuild the index, returning it with the valid end of the file
    fn replay(file: &File) -> Result<(HashMap<Vec<u8>, ValuePointer>, u64, RecoveryResult)> {
        let len = file.metadata()?.len();
        let mut data = vec![0u8; len as usize];
        file.read_exact_at(&mut data, 0)?;

        let mut index = HashMap::new();
        let mut recovery = RecoveryResult::default();
        let mut pos = 0usize;

        while pos < data.len() {
            match decode_record(&data[pos..]) {
                Some((record_len, key, value)) => {
                    match value {
                        Some((value_start, value_len)) => {
                            index.insert(
                                key.to_vec(),
                                ValuePointer {
                                    offset: (pos + value_start) as u64,
                                    len: value_len,
                                },
                            );
                        }
                        None => {
                            index.remove(key);
                        }
                    }
                    recovery.records_recovered += 1;
                    pos += record_len;
                }
                None => break,
            }
        }

        recovery.bytes_truncated = (data.len() - pos) as u64;
        Ok((index, pos as u64, recovery))
    }

    /// Append encoded records and publish their index updates
    fn append(&self, records: &[(&[u8], Option<&[u8]>)]) -> Result<()> {
        let mut buf = Vec::new();
        let mut pointers = Vec::with_capacity(records.len());
        for &(key, value) in records {
            let value_start = encode_record(&mut buf, key, value)?;
            pointers.push(value.map(|v| (value_start, v.len() as u32)));
        }

        let mut tail = self.tail.lock();
        self.file.write_all_at(&buf, *tail)?;
        if self.sync {
            self.file.sync_data()?;
        }

        let mut index = self.index.write();
        for ((key, _), pointer) in records.iter().zip(pointers) {
            match pointer {
                Some((value_start, len)) => {
                    index.insert(
                        key.to_vec(),
                        ValuePointer {
                            offset: *tail + value_start as u64,
                            len,
                        },
                    );
                }
                None => {
                    index.remove(*key);
                }
            }
        }
        *tail += buf.len() as u64;
        Ok(())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the data file
    pub fn file_size(&self) -> u64 {
        *self.tail.lock()
    }

    /// What the last open recovered
    pub fn recovery(&self) -> RecoveryResult {
        self.recovery
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for LogStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&[(key, Some(value))])
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let pointer = match self.index.read().get(key) {
            Some(pointer) => *pointer,
            None => return Ok(None),
        };

        let mut value = vec![0u8; pointer.len as usize];
        self.file.read_exact_at(&mut value, pointer.offset)?;
        Ok(Some(value))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        if !self.index.read().contains_key(key) {
            return Ok(false);
        }
        self.append(&[(key, None)])?;
        Ok(true)
    }

    fn put_batch(&self, batch: &[BatchEntry], buffer: &[u8]) -> Result<()> {
        let records = batch
            .iter()
            .map(|entry| Ok((entry.key.as_slice(), Some(entry.value(buffer)?))))
            .collect::<Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(());
        }
        self.append(&records)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Append one record to `buf`, returning where its value starts within `buf`
fn encode_record(buf: &mut Vec<u8>, key: &[u8], value: Option<&[u8]>) -> Result<usize> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| StageError::Store(format!("key of {} bytes is too large", key.len())))?;
    let val_len = match value {
        Some(v) => match u32::try_from(v.len()) {
            Ok(len) if len != TOMBSTONE_MARKER => len,
            _ => {
                return Err(StageError::Store(format!(
                    "value of {} bytes is too large",
                    v.len()
                )))
            }
        },
        None => TOMBSTONE_MARKER,
    };

    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]); // CRC placeholder
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(&val_len.to_le_bytes());
    buf.extend_from_slice(key);
    let value_start = buf.len();
    if let Some(v) = value {
        buf.extend_from_slice(v);
    }

    let crc = crc32fast::hash(&buf[start + 4..]);
    buf[start..start + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(value_start)
}

/// Parse the record at the front of `data`
///
/// Returns `(record_len, key, Some((value_start, value_len)) | None for tombstone)`,
/// or `None` when the record is torn or fails its checksum.
fn decode_record(data: &[u8]) -> Option<(usize, &[u8], Option<(usize, u32)>)> {
    if data.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let crc = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let key_len = u32::from_le_bytes(data[4..8].try_into().ok()?) as usize;
    let val_len = u32::from_le_bytes(data[8..12].try_into().ok()?);

    let value_start = RECORD_HEADER_SIZE + key_len;
    let body_len = if val_len == TOMBSTONE_MARKER { 0 } else { val_len as usize };
    let record_len = value_start.checked_add(body_len)?;
    if data.len() < record_len {
        return None;
    }
    if crc32fast::hash(&data[4..record_len]) != crc {
        return None;
    }

    let key = &data[RECORD_HEADER_SIZE..value_start];
    let value = (val_len != TOMBSTONE_MARKER).then_some((value_start, val_len));
    Some((record_len, key, value))
}
