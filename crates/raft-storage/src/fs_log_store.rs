//! # fs_log_store
//!
//! why: the raft log has to survive restarts and crashes
//! relations: implements raft_core::LogStore, opened by FileStateManager
//! what: FsLogStore over three files plus a cache of the most recent entries
//!
//! Layout inside the store directory:
//! - `store.idx`: one little-endian u64 per entry, its offset in `store.dat`
//! - `store.dat`: serialized entries back to back
//! - `store.sti`: the index of the first entry, as a little-endian u64
//!
//! Destructive operations copy the three files to `*.bak` first and copy
//! them back if anything fails half way. `store.sti.bak` is written last and
//! removed first, so finding all three backups on open means a change was
//! interrupted; the backups are restored before loading.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::ReentrantMutex;
use raft_core::log::{pack_entries, unpack_entries};
use raft_core::{Buffer, LogEntry, LogStore, LogStoreError};
use tracing::{debug, error, info, warn};

const INDEX_FILE: &str = "store.idx";
const DATA_FILE: &str = "store.dat";
const START_INDEX_FILE: &str = "store.sti";
const STORE_FILES: [&str; 3] = [INDEX_FILE, DATA_FILE, START_INDEX_FILE];
const OFFSET_SIZE: u64 = 8;

/// Entries kept in memory when no size is given
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

// -- tail cache --

/// The most recent entries. When not empty, its last index is the store's last index.
#[derive(Debug)]
struct LogStoreBuffer {
    entries: VecDeque<LogEntry>,
    start_idx: u64,
    max_size: usize,
}

impl LogStoreBuffer {
    fn new(start_idx: u64, max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            start_idx,
            max_size,
        }
    }

    fn last_entry(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    fn get(&self, idx: u64) -> Option<&LogEntry> {
        if idx < self.start_idx {
            return None;
        }
        self.entries.get((idx - self.start_idx) as usize)
    }

    /// Drop `from` and everything after it.
    fn trim(&mut self, from: u64) {
        if from <= self.start_idx {
            self.reset(from);
        } else {
            self.entries.truncate((from - self.start_idx) as usize);
        }
    }

    /// Drop everything before `idx`.
    fn drop_before(&mut self, idx: u64) {
        while self.start_idx < idx && !self.entries.is_empty() {
            self.entries.pop_front();
            self.start_idx += 1;
        }
        if self.entries.is_empty() {
            self.start_idx = self.start_idx.max(idx);
        }
    }

    fn append(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > self.max_size {
            self.entries.pop_front();
            self.start_idx += 1;
        }
    }

    fn reset(&mut self, start_idx: u64) {
        self.entries.clear();
        self.start_idx = start_idx;
    }
}

// -- files --

struct Files {
    index: File,
    data: File,
    start: File,
}

impl Files {
    fn open(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            index: open_rw(&dir.join(INDEX_FILE))?,
            data: open_rw(&dir.join(DATA_FILE))?,
            start: open_rw(&dir.join(START_INDEX_FILE))?,
        })
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn backup_name(name: &str) -> String {
    format!("{name}.bak")
}

struct Inner {
    /// `None` once closed
    files: Option<Files>,
    start_idx: u64,
    /// Entries held by the files
    count: u64,
    data_len: u64,
    buf: LogStoreBuffer,
}

impl Inner {
    fn load(dir: &Path, buf_size: usize) -> io::Result<Self> {
        let mut inner = Self {
            files: Some(Files::open(dir)?),
            start_idx: 1,
            count: 0,
            data_len: 0,
            buf: LogStoreBuffer::new(1, buf_size),
        };
        inner.reload()?;
        Ok(inner)
    }

    /// Re-read sizes and the start index from the files and refill the cache.
    fn reload(&mut self) -> io::Result<()> {
        let files = self.files()?;
        let start_idx = if files.start.metadata()?.len() < OFFSET_SIZE {
            files.start.set_len(0)?;
            files.start.seek(SeekFrom::Start(0))?;
            files.start.write_u64::<LittleEndian>(1)?;
            files.start.sync_all()?;
            1
        } else {
            files.start.seek(SeekFrom::Start(0))?;
            files.start.read_u64::<LittleEndian>()?
        };
        let count = files.index.metadata()?.len() / OFFSET_SIZE;
        let data_len = files.data.metadata()?.len();

        self.start_idx = start_idx;
        self.count = count;
        self.data_len = data_len;

        self.refill_cache()
    }

    /// Load the newest entries from the files into an empty cache.
    fn refill_cache(&mut self) -> io::Result<()> {
        let next = self.next_slot();
        let first = self.start_idx.max(next.saturating_sub(self.buf.max_size as u64));
        self.buf.reset(first);
        for idx in first..next {
            let entry = self.read_entry(idx).map_err(into_io)?;
            self.buf.append(entry);
        }
        Ok(())
    }

    fn last_entry(&mut self) -> Result<Option<LogEntry>, LogStoreError> {
        if let Some(entry) = self.buf.last_entry() {
            return Ok(Some(entry.clone()));
        }
        if self.count == 0 {
            return Ok(None);
        }
        self.read_entry(self.next_slot() - 1).map(Some)
    }

    fn files(&mut self) -> io::Result<&mut Files> {
        self.files
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "log store is closed"))
    }

    fn next_slot(&self) -> u64 {
        self.start_idx + self.count
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

    /// Offset in the data file of the entry at file position `pos`; the
    /// data length for the position one past the end.
    fn offset_of(&mut self, pos: u64) -> io::Result<u64> {
        if pos >= self.count {
            return Ok(self.data_len);
        }
        let files = self.files()?;
        files.index.seek(SeekFrom::Start(pos * OFFSET_SIZE))?;
        files.index.read_u64::<LittleEndian>()
    }

    fn read_entry(&mut self, index: u64) -> Result<LogEntry, LogStoreError> {
        let pos = index - self.start_idx;
        let begin = self.offset_of(pos)?;
        let end = self.offset_of(pos + 1)?;
        if end < begin {
            return Err(LogStoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupted index file at position {pos}"),
            )));
        }
        let mut bytes = vec![0u8; (end - begin) as usize];
        let files = self.files()?;
        files.data.seek(SeekFrom::Start(begin))?;
        files.data.read_exact(&mut bytes)?;
        Ok(LogEntry::from_bytes(&bytes)?)
    }

    fn entry(&mut self, index: u64) -> Result<LogEntry, LogStoreError> {
        match self.buf.get(index) {
            Some(entry) => Ok(entry.clone()),
            None => self.read_entry(index),
        }
    }

    fn append_entry(&mut self, entry: &LogEntry) -> Result<u64, LogStoreError> {
        let bytes = entry.serialize()?.into_vec();
        let (pos, offset) = (self.count, self.data_len);
        let files = self.files()?;
        files.data.seek(SeekFrom::Start(offset))?;
        files.data.write_all(&bytes)?;
        files.data.sync_data()?;
        files.index.seek(SeekFrom::Start(pos * OFFSET_SIZE))?;
        files.index.write_u64::<LittleEndian>(offset)?;
        files.index.sync_data()?;

        let idx = self.next_slot();
        self.count += 1;
        self.data_len += bytes.len() as u64;
        self.buf.append(entry.clone());
        Ok(idx)
    }

    /// Drop `index` and everything after it.
    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        let pos = index - self.start_idx;
        let offset = self.offset_of(pos)?;
        let files = self.files()?;
        files.index.set_len(pos * OFFSET_SIZE)?;
        files.index.sync_all()?;
        files.data.set_len(offset)?;
        files.data.sync_all()?;
        self.count = pos;
        self.data_len = offset;
        self.buf.trim(index);
        if self.buf.last_entry().is_none() && self.count > 0 {
            self.refill_cache()?;
        }
        Ok(())
    }

    fn write_start_idx(&mut self, start_idx: u64) -> io::Result<()> {
        let files = self.files()?;
        files.start.seek(SeekFrom::Start(0))?;
        files.start.write_u64::<LittleEndian>(start_idx)?;
        files.start.sync_all()?;
        self.start_idx = start_idx;
        Ok(())
    }

    /// Empty store whose next entry gets `start_idx`.
    fn reset_to(&mut self, start_idx: u64) -> io::Result<()> {
        let files = self.files()?;
        files.index.set_len(0)?;
        files.index.sync_all()?;
        files.data.set_len(0)?;
        files.data.sync_all()?;
        self.count = 0;
        self.data_len = 0;
        self.write_start_idx(start_idx)?;
        self.buf.reset(start_idx);
        Ok(())
    }
}

fn into_io(err: LogStoreError) -> io::Error {
    match err {
        LogStoreError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

// -- store --

/// File backed [`LogStore`].
///
/// Every append and overwrite is fsynced before the call returns.
pub struct FsLogStore {
    dir: PathBuf,
    inner: ReentrantMutex<RefCell<Inner>>,
    fail_next_compaction: AtomicBool,
}

impl FsLogStore {
    /// Open or create the store in `dir`, caching up to `buf_size` entries.
    pub fn open(dir: impl Into<PathBuf>, buf_size: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        recover_interrupted_change(&dir)?;
        let inner = Inner::load(&dir, buf_size)?;
        info!(
            dir = %dir.display(),
            start_idx = inner.start_idx,
            next_slot = inner.next_slot(),
            "log store opened"
        );
        Ok(Self {
            dir,
            inner: ReentrantMutex::new(RefCell::new(inner)),
            fail_next_compaction: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush and release the files. Opening the directory again restores
    /// the same contents.
    pub fn close(&self) -> io::Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if let Some(files) = inner.files.take() {
            files.index.sync_all()?;
            files.data.sync_all()?;
            files.start.sync_all()?;
            debug!(dir = %self.dir.display(), "log store closed");
        }
        Ok(())
    }

    /// Make the next compaction fail after it has started rewriting files.
    pub fn fail_next_compaction(&self) {
        self.fail_next_compaction.store(true, Ordering::SeqCst);
    }

    fn backup(&self) -> io::Result<()> {
        for name in STORE_FILES {
            copy_synced(&self.dir.join(name), &self.dir.join(backup_name(name)))?;
        }
        Ok(())
    }

    fn restore(&self, inner: &mut Inner) -> io::Result<()> {
        restore_files(&self.dir)?;
        inner.reload()?;
        discard_backup(&self.dir);
        Ok(())
    }

    fn discard_backup(&self) {
        discard_backup(&self.dir);
    }

    /// Run a destructive change with the files backed up; on failure the
    /// backup is restored and the error returned.
    fn guarded<T>(
        &self,
        inner: &mut Inner,
        change: impl FnOnce(&mut Inner) -> Result<T, LogStoreError>,
    ) -> Result<T, LogStoreError> {
        self.backup()?;
        match change(inner) {
            Ok(value) => {
                self.discard_backup();
                Ok(value)
            }
            Err(err) => {
                warn!(dir = %self.dir.display(), %err, "log store change failed, restoring backup");
                if let Err(restore_err) = self.restore(inner) {
                    error!(dir = %self.dir.display(), %restore_err, "failed to restore the log store backup");
                }
                Err(err)
            }
        }
    }

    fn compact_files(&self, inner: &mut Inner, last_log_index: u64) -> Result<(), LogStoreError> {
        if last_log_index + 1 >= inner.next_slot() {
            if self.fail_next_compaction.swap(false, Ordering::SeqCst) {
                inner.files()?.index.set_len(0)?;
                return Err(injected_failure());
            }
            inner.reset_to(last_log_index + 1)?;
            return Ok(());
        }

        let keep_from = last_log_index + 1 - inner.start_idx;
        let base = inner.offset_of(keep_from)?;
        let (count, data_len) = (inner.count, inner.data_len);

        let files = inner.files()?;
        let mut data = vec![0u8; (data_len - base) as usize];
        files.data.seek(SeekFrom::Start(base))?;
        files.data.read_exact(&mut data)?;
        let mut offsets = vec![0u8; ((count - keep_from) * OFFSET_SIZE) as usize];
        files.index.seek(SeekFrom::Start(keep_from * OFFSET_SIZE))?;
        files.index.read_exact(&mut offsets)?;

        files.data.set_len(0)?;
        files.data.seek(SeekFrom::Start(0))?;
        files.data.write_all(&data)?;
        files.data.sync_all()?;

        if self.fail_next_compaction.swap(false, Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let mut rebased = Vec::with_capacity(offsets.len());
        let mut reader = offsets.as_slice();
        while !reader.is_empty() {
            rebased.write_u64::<LittleEndian>(reader.read_u64::<LittleEndian>()? - base)?;
        }
        files.index.set_len(0)?;
        files.index.seek(SeekFrom::Start(0))?;
        files.index.write_all(&rebased)?;
        files.index.sync_all()?;

        inner.count = count - keep_from;
        inner.data_len = data_len - base;
        inner.write_start_idx(last_log_index + 1)?;
        inner.buf.drop_before(last_log_index + 1);
        Ok(())
    }
}

fn copy_synced(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    File::open(to)?.sync_all()
}

fn restore_files(dir: &Path) -> io::Result<()> {
    for name in STORE_FILES {
        copy_synced(&dir.join(backup_name(name)), &dir.join(name))?;
    }
    Ok(())
}

/// Backups go away start index first, the reverse of the order they are written in.
fn discard_backup(dir: &Path) {
    for name in STORE_FILES.iter().rev() {
        let _ = fs::remove_file(dir.join(backup_name(name)));
    }
}

/// Put back the files of a change that never finished, e.g. a compaction cut
/// short by a crash between rewriting the data and the index.
fn recover_interrupted_change(dir: &Path) -> io::Result<()> {
    let complete = STORE_FILES
        .iter()
        .all(|name| dir.join(backup_name(name)).exists());
    if complete {
        warn!(dir = %dir.display(), "found backups of an interrupted change, restoring them");
        restore_files(dir)?;
    }
    discard_backup(dir);
    Ok(())
}

fn injected_failure() -> LogStoreError {
    LogStoreError::Io(io::Error::new(io::ErrorKind::Other, "injected compaction failure"))
}

impl LogStore for FsLogStore {
    fn next_slot(&self) -> u64 {
        self.inner.lock().borrow().next_slot()
    }

    fn start_index(&self) -> u64 {
        self.inner.lock().borrow().start_idx
    }

    fn last_entry(&self) -> LogEntry {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        match inner.last_entry() {
            Ok(entry) => entry.unwrap_or_else(LogEntry::sentinel),
            Err(err) => {
                error!(%err, "failed to read the last log entry");
                LogEntry::sentinel()
            }
        }
    }

    fn append(&self, entry: &LogEntry) -> Result<u64, LogStoreError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.append_entry(entry)
    }

    fn write_at(&self, index: u64, entry: &LogEntry) -> Result<(), LogStoreError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.check_lower(index)?;
        let next_slot = inner.next_slot();
        if index > next_slot {
            return Err(LogStoreError::OutOfRange {
                index,
                start_index: inner.start_idx,
                next_slot,
            });
        }
        if index == next_slot {
            inner.append_entry(entry)?;
            return Ok(());
        }

        self.guarded(&mut inner, |inner| {
            inner.truncate_from(index)?;
            inner.append_entry(entry)?;
            Ok(())
        })
    }

    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, LogStoreError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.check_lower(start)?;
        let end = end.min(inner.next_slot());
        (start..end).map(|idx| inner.entry(idx)).collect()
    }

    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, LogStoreError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.check_lower(index)?;
        if index >= inner.next_slot() {
            return Ok(None);
        }
        inner.entry(index).map(Some)
    }

    fn term_at(&self, index: u64) -> u64 {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if index < inner.start_idx || index >= inner.next_slot() {
            return 0;
        }
        match inner.entry(index) {
            Ok(entry) => entry.term(),
            Err(err) => {
                error!(index, %err, "failed to read a log entry");
                0
            }
        }
    }

    fn pack(&self, index: u64, count: u64) -> Result<Buffer, LogStoreError> {
        let entries = self.entries(index, index.saturating_add(count))?;
        Ok(pack_entries(&entries)?)
    }

    fn apply_pack(&self, index: u64, pack: &Buffer) -> Result<(), LogStoreError> {
        let entries = unpack_entries(pack)?;
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let skip = inner.start_idx.saturating_sub(index) as usize;
        let index = index.max(inner.start_idx);
        let next_slot = inner.next_slot();
        if index > next_slot {
            self.guarded(&mut inner, |inner| Ok(inner.reset_to(index)?))?;
        } else if index < next_slot {
            self.guarded(&mut inner, |inner| Ok(inner.truncate_from(index)?))?;
        }
        for entry in entries.iter().skip(skip) {
            inner.append_entry(entry)?;
        }
        debug!(index, count = entries.len() - skip.min(entries.len()), "log pack applied");
        Ok(())
    }

    fn compact(&self, last_log_index: u64) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if last_log_index < inner.start_idx {
            return true;
        }

        match self.guarded(&mut inner, |inner| self.compact_files(inner, last_log_index)) {
            Ok(()) => {
                info!(
                    dir = %self.dir.display(),
                    start_idx = inner.start_idx,
                    next_slot = inner.next_slot(),
                    "log store compacted"
                );
                true
            }
            Err(err) => {
                error!(dir = %self.dir.display(), last_log_index, %err, "failed to compact the log store");
                false
            }
        }
    }
}

impl Drop for FsLogStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(dir = %self.dir.display(), %err, "failed to close the log store");
        }
    }
}
