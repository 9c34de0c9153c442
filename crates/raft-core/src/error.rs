//! # error
//!
//! why: give every layer of the consensus core a typed failure instead of aborting
//! relations: buffer/records raise BufferError, log stores raise LogStoreError,
//!            transports raise RpcError, the server folds them into RaftError
//! what: error enums built on thiserror, plus the fatal/recoverable split

use std::io;

use thiserror::Error;

/// Failures of the fixed-layout binary codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// A put would run past the end of the buffer.
    #[error("insufficient buffer to store {needed} bytes ({available} available)")]
    Overflow { needed: usize, available: usize },

    /// A get would read past the end of the buffer.
    #[error("insufficient buffer to read {needed} bytes ({available} available)")]
    Underflow { needed: usize, available: usize },

    /// No NUL byte was found between the cursor and the end of the buffer.
    #[error("string is not terminated before the end of the buffer")]
    Unterminated,

    #[error("string is not valid utf-8")]
    InvalidUtf8,

    /// The bytes decoded but do not describe a valid record.
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Failures reported by a [`crate::LogStore`].
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// The requested index has already been compacted away.
    #[error("log index {index} is below the start index {start_index}")]
    Compacted { index: u64, start_index: u64 },

    #[error("log index {index} is outside of [{start_index}, {next_slot}]")]
    OutOfRange {
        index: u64,
        start_index: u64,
        next_slot: u64,
    },

    #[error("corrupted log record: {0}")]
    Codec(#[from] BufferError),

    #[error("log store i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Transport level failures, i.e. the request never got a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Connection to the target server failed
    #[error("connection to {0} failed")]
    ConnectionFailed(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    /// The remote handler failed without producing a response
    #[error("remote server failed to handle the request: {0}")]
    Remote(String),
}

/// Reported by a state machine that could not materialize a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("snapshot creation failed: {0}")]
pub struct SnapshotError(pub String);

/// Errors surfaced by the raft server.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A protocol invariant is broken; the process must not continue.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    LogStore(#[from] LogStoreError),

    #[error(transparent)]
    Codec(#[from] BufferError),

    /// Term, vote, commit index or configuration could not be made durable.
    #[error("failed to persist server state: {0}")]
    Persistence(#[from] io::Error),

    #[error("server is shut down")]
    ShutDown,
}

impl RaftError {
    pub(crate) fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the supervisor has to terminate the process for this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_persistence_errors_terminate() {
        assert!(RaftError::fatal("split brain").is_fatal());
        assert!(RaftError::from(io::Error::new(io::ErrorKind::Other, "disk")).is_fatal());
        assert!(!RaftError::from(BufferError::Unterminated).is_fatal());
        assert!(!RaftError::ShutDown.is_fatal());
    }

    #[test]
    fn buffer_errors_render_sizes() {
        let err = BufferError::Overflow {
            needed: 8,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "insufficient buffer to store 8 bytes (3 available)"
        );
    }
}
