//! # log
//!
//! why: manage the append-only log of entries that raft replicates
//! relations: used by the raft server for replication and commit, implemented
//!            on disk by raft-storage
//! what: LogStore trait, pack/unpack batch codec, InMemLogStore reference store
//!
//! Indexes are 1-based. `start_index()` is the first retained index and
//! `next_slot()` the index the next append will receive; the store holds
//! `[start_index, next_slot)`.

use parking_lot::Mutex;

use crate::buffer::{Buffer, SZ_INT, SZ_ULONG};
use crate::error::{BufferError, LogStoreError};
use crate::log_entry::LogEntry;

/// Ordered, durable sequence of log entries.
///
/// Implementations lock internally; every method takes `&self`.
pub trait LogStore: Send + Sync {
    /// Index the next appended entry will get
    fn next_slot(&self) -> u64;

    /// First index still held by the store
    fn start_index(&self) -> u64;

    /// Last entry, or [`LogEntry::sentinel`] when the store is empty
    fn last_entry(&self) -> LogEntry;

    /// Append and return the index the entry was stored at.
    fn append(&self, entry: &LogEntry) -> Result<u64, LogStoreError>;

    /// Store `entry` at `index` and drop everything after it.
    ///
    /// `index` must lie in `[start_index, next_slot]`; `next_slot` appends.
    fn write_at(&self, index: u64, entry: &LogEntry) -> Result<(), LogStoreError>;

    /// Entries in `[start, end)`, clipped to `next_slot`.
    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, LogStoreError>;

    /// Entry at `index`, `None` at or past `next_slot`.
    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, LogStoreError>;

    /// Term at `index`, 0 when the index is not held.
    fn term_at(&self, index: u64) -> u64;

    /// Up to `count` entries from `index` as one opaque batch.
    fn pack(&self, index: u64, count: u64) -> Result<Buffer, LogStoreError>;

    /// Write the entries of a batch starting at `index`, replacing any tail.
    fn apply_pack(&self, index: u64, pack: &Buffer) -> Result<(), LogStoreError>;

    /// Discard everything up to and including `last_log_index`.
    ///
    /// Returns false, with the store unchanged, when compaction fails.
    fn compact(&self, last_log_index: u64) -> bool;
}

/// Encode entries as `[idx_table_len:i32][data_len:i32][offsets:u64...][data]`.
///
/// Offsets are relative to the start of the data section and the table length
/// is in bytes.
pub fn pack_entries(entries: &[LogEntry]) -> Result<Buffer, BufferError> {
    let idx_len = entries.len() * SZ_ULONG;
    let data_len: usize = entries.iter().map(LogEntry::serialized_len).sum();
    let idx_len_i32 = i32::try_from(idx_len).map_err(|_| BufferError::Malformed("pack index table"))?;
    let data_len_i32 = i32::try_from(data_len).map_err(|_| BufferError::Malformed("pack data"))?;

    let mut buf = Buffer::alloc(SZ_INT * 2 + idx_len + data_len);
    buf.put_i32(idx_len_i32)?;
    buf.put_i32(data_len_i32)?;
    let mut offset = 0u64;
    for entry in entries {
        buf.put_u64(offset)?;
        offset += entry.serialized_len() as u64;
    }
    for entry in entries {
        buf.put_buffer(&entry.serialize()?)?;
    }
    buf.set_pos(0);
    Ok(buf)
}

/// Decode a batch produced by [`pack_entries`].
pub fn unpack_entries(pack: &Buffer) -> Result<Vec<LogEntry>, BufferError> {
    let mut buf = Buffer::copy(pack);
    let idx_len = buf.get_i32()?;
    let data_len = buf.get_i32()?;
    if idx_len < 0 || data_len < 0 || idx_len as usize % SZ_ULONG != 0 {
        return Err(BufferError::Malformed("pack header"));
    }
    let (idx_len, data_len) = (idx_len as usize, data_len as usize);
    if buf.remaining() != idx_len + data_len {
        return Err(BufferError::Malformed("pack length"));
    }

    let count = idx_len / SZ_ULONG;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(buf.get_u64()? as usize);
    }
    let data = buf.get_bytes(data_len)?;

    let mut entries = Vec::with_capacity(count);
    for (i, &begin) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data_len);
        if begin > end || end > data_len {
            return Err(BufferError::Malformed("pack offsets"));
        }
        entries.push(LogEntry::from_bytes(&data[begin..end])?);
    }
    Ok(entries)
}

// -- in-memory store --

#[derive(Debug)]
struct MemLog {
    start_idx: u64,
    entries: Vec<LogEntry>,
}

impl MemLog {
    fn next_slot(&self) -> u64 {
        self.start_idx + self.entries.len() as u64
    }

    fn check_lower(&self, index: u64) -> Result<(), LogStoreError> {
        if index < self.start_idx {
            return Err(LogStoreError::Compacted {
                index,
                start_index: self.start_idx,
            });
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) {
        self.entries.truncate((index - self.start_idx) as usize);
    }
}

/// Volatile log store, the reference implementation of [`LogStore`].
#[derive(Debug)]
pub struct InMemLogStore {
    log: Mutex<MemLog>,
}

impl InMemLogStore {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MemLog {
                start_idx: 1,
                entries: Vec::new(),
            }),
        }
    }
}

impl Default for InMemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for InMemLogStore {
    fn next_slot(&self) -> u64 {
        self.log.lock().next_slot()
    }

    fn start_index(&self) -> u64 {
        self.log.lock().start_idx
    }

    fn last_entry(&self) -> LogEntry {
        self.log
            .lock()
            .entries
            .last()
            .cloned()
            .unwrap_or_else(LogEntry::sentinel)
    }

    fn append(&self, entry: &LogEntry) -> Result<u64, LogStoreError> {
        let mut log = self.log.lock();
        let idx = log.next_slot();
        log.entries.push(entry.clone());
        Ok(idx)
    }

    fn write_at(&self, index: u64, entry: &LogEntry) -> Result<(), LogStoreError> {
        let mut log = self.log.lock();
        log.check_lower(index)?;
        if index > log.next_slot() {
            return Err(LogStoreError::OutOfRange {
                index,
                start_index: log.start_idx,
                next_slot: log.next_slot(),
            });
        }
        log.truncate_from(index);
        log.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, LogStoreError> {
        let log = self.log.lock();
        log.check_lower(start)?;
        let end = end.min(log.next_slot());
        if start >= end {
            return Ok(Vec::new());
        }
        let from = (start - log.start_idx) as usize;
        let to = (end - log.start_idx) as usize;
        Ok(log.entries[from..to].to_vec())
    }

    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, LogStoreError> {
        let log = self.log.lock();
        log.check_lower(index)?;
        Ok(log.entries.get((index - log.start_idx) as usize).cloned())
    }

    fn term_at(&self, index: u64) -> u64 {
        let log = self.log.lock();
        if index < log.start_idx {
            return 0;
        }
        log.entries
            .get((index - log.start_idx) as usize)
            .map_or(0, LogEntry::term)
    }

    fn pack(&self, index: u64, count: u64) -> Result<Buffer, LogStoreError> {
        let entries = self.entries(index, index.saturating_add(count))?;
        Ok(pack_entries(&entries)?)
    }

    fn apply_pack(&self, index: u64, pack: &Buffer) -> Result<(), LogStoreError> {
        let entries = unpack_entries(pack)?;
        let mut log = self.log.lock();

        // entries below the start index are already compacted on this side
        let skip = log.start_idx.saturating_sub(index) as usize;
        let index = index.max(log.start_idx);
        if index > log.next_slot() {
            log.entries.clear();
            log.start_idx = index;
        } else {
            log.truncate_from(index);
        }
        log.entries.extend(entries.into_iter().skip(skip));
        Ok(())
    }

    fn compact(&self, last_log_index: u64) -> bool {
        let mut log = self.log.lock();
        if last_log_index < log.start_idx {
            return true;
        }
        if last_log_index >= log.next_slot() {
            log.entries.clear();
        } else {
            let drop = (last_log_index + 1 - log.start_idx) as usize;
            log.entries.drain(..drop);
        }
        log.start_idx = last_log_index + 1;
        true
    }
}
