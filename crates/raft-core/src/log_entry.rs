//! # log_entry
//!
//! why: the unit of replication, identical on the wire and on disk
//! relations: stored by log.rs implementations, carried by message.rs requests
//! what: LogValType tag, LogEntry record, `[term:u64][type:u8][payload...]` codec

use crate::buffer::{Buffer, SZ_BYTE, SZ_ULONG};
use crate::error::BufferError;

/// What the payload of a log entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogValType {
    /// Opaque application command, fed to the state machine
    AppLog = 1,
    /// Serialized ClusterConfig
    Conf = 2,
    /// Serialized SrvConfig, used by add-server requests
    ClusterServer = 3,
    /// Batch of entries produced by `LogStore::pack`
    LogPack = 4,
    /// Serialized SnapshotSyncReq
    SnpSyncReq = 5,
}

impl TryFrom<u8> for LogValType {
    type Error = BufferError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            1 => Ok(Self::AppLog),
            2 => Ok(Self::Conf),
            3 => Ok(Self::ClusterServer),
            4 => Ok(Self::LogPack),
            5 => Ok(Self::SnpSyncReq),
            _ => Err(BufferError::Malformed("log value type")),
        }
    }
}

/// A single entry in the replicated log
///
/// Entries are immutable once built; stores hand out clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    term: u64,
    value_type: LogValType,
    payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, payload: Vec<u8>, value_type: LogValType) -> Self {
        Self {
            term,
            value_type,
            payload,
        }
    }

    /// Application entry, the common case
    pub fn app(term: u64, payload: Vec<u8>) -> Self {
        Self::new(term, payload, LogValType::AppLog)
    }

    /// Returned by `last_entry` on an empty store: term 0, no payload.
    pub fn sentinel() -> Self {
        Self::app(0, Vec::new())
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn value_type(&self) -> LogValType {
        self.value_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn serialized_len(&self) -> usize {
        SZ_ULONG + SZ_BYTE + self.payload.len()
    }

    pub fn serialize(&self) -> Result<Buffer, BufferError> {
        let mut buf = Buffer::alloc(self.serialized_len());
        buf.put_u64(self.term)?;
        buf.put_byte(self.value_type as u8)?;
        buf.put_bytes(&self.payload)?;
        buf.set_pos(0);
        Ok(buf)
    }

    /// Decode an entry that spans the whole unread part of `buf`.
    pub fn deserialize(buf: &mut Buffer) -> Result<Self, BufferError> {
        let term = buf.get_u64()?;
        let value_type = LogValType::try_from(buf.get_byte()?)?;
        let payload = buf.get_bytes(buf.remaining())?;
        Ok(Self::new(term, payload, value_type))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        Self::deserialize(&mut Buffer::from_vec(bytes.to_vec()))
    }

    /// Peek the term of a serialized entry without moving the cursor.
    pub fn term_in_buffer(buf: &Buffer) -> Result<u64, BufferError> {
        let mut peek = Buffer::copy(buf);
        peek.get_u64()
    }
}
