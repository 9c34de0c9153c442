//! # snapshot
//!
//! why: compacted logs are replaced by a state machine image plus its metadata
//! relations: produced by the state machine, shipped to lagging peers by the server
//! what: Snapshot metadata, SnapshotSyncReq chunk record, per-peer SnapshotSyncCtx

use std::sync::Arc;

use crate::buffer::{Buffer, SZ_BYTE, SZ_ULONG};
use crate::cluster_config::ClusterConfig;
use crate::error::BufferError;

/// Metadata of a state machine image covering the log up to `last_log_idx`.
///
/// The image bytes themselves belong to the state machine and are addressed
/// by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    last_log_idx: u64,
    last_log_term: u64,
    size: u64,
    last_config: Arc<ClusterConfig>,
}

impl Snapshot {
    pub fn new(
        last_log_idx: u64,
        last_log_term: u64,
        last_config: Arc<ClusterConfig>,
        size: u64,
    ) -> Self {
        Self {
            last_log_idx,
            last_log_term,
            size,
            last_config,
        }
    }

    pub fn last_log_idx(&self) -> u64 {
        self.last_log_idx
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }

    /// Image size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn last_config(&self) -> &Arc<ClusterConfig> {
        &self.last_config
    }

    fn serialized_len(&self) -> usize {
        SZ_ULONG * 3 + self.last_config.serialized_len()
    }

    fn write_to(&self, buf: &mut Buffer) -> Result<(), BufferError> {
        buf.put_u64(self.last_log_idx)?;
        buf.put_u64(self.last_log_term)?;
        buf.put_u64(self.size)?;
        self.last_config.write_to(buf)
    }

    fn read_from(buf: &mut Buffer) -> Result<Self, BufferError> {
        let last_log_idx = buf.get_u64()?;
        let last_log_term = buf.get_u64()?;
        let size = buf.get_u64()?;
        let last_config = Arc::new(ClusterConfig::read_from(buf)?);
        Ok(Self {
            last_log_idx,
            last_log_term,
            size,
            last_config,
        })
    }

    /// `[last_log_idx:u64][last_log_term:u64][size:u64][cluster_config]`
    pub fn serialize(&self) -> Result<Buffer, BufferError> {
        let mut buf = Buffer::alloc(self.serialized_len());
        self.write_to(&mut buf)?;
        buf.set_pos(0);
        Ok(buf)
    }

    pub fn deserialize(buf: &mut Buffer) -> Result<Self, BufferError> {
        Self::read_from(buf)
    }
}

/// One chunk of a snapshot image in flight to a follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSyncReq {
    snapshot: Arc<Snapshot>,
    offset: u64,
    data: Vec<u8>,
    done: bool,
}

impl SnapshotSyncReq {
    pub fn new(snapshot: Arc<Snapshot>, offset: u64, data: Vec<u8>, done: bool) -> Self {
        Self {
            snapshot,
            offset,
            data,
            done,
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Last chunk of the image
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// `[snapshot][offset:u64][done:u8][raw chunk...]`
    pub fn serialize(&self) -> Result<Buffer, BufferError> {
        let len = self.snapshot.serialized_len() + SZ_ULONG + SZ_BYTE + self.data.len();
        let mut buf = Buffer::alloc(len);
        self.snapshot.write_to(&mut buf)?;
        buf.put_u64(self.offset)?;
        buf.put_byte(u8::from(self.done))?;
        buf.put_bytes(&self.data)?;
        buf.set_pos(0);
        Ok(buf)
    }

    pub fn deserialize(buf: &mut Buffer) -> Result<Self, BufferError> {
        let snapshot = Arc::new(Snapshot::read_from(buf)?);
        let offset = buf.get_u64()?;
        let done = match buf.get_byte()? {
            0 => false,
            1 => true,
            _ => return Err(BufferError::Malformed("snapshot sync done flag")),
        };
        let data = buf.get_bytes(buf.remaining())?;
        Ok(Self {
            snapshot,
            offset,
            data,
            done,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        Self::deserialize(&mut Buffer::from_vec(bytes.to_vec()))
    }
}

/// Progress of a snapshot transfer to one peer
#[derive(Debug, Clone)]
pub struct SnapshotSyncCtx {
    snapshot: Arc<Snapshot>,
    offset: u64,
}

impl SnapshotSyncCtx {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            offset: 0,
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }
}
