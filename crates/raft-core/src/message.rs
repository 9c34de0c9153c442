//! # message
//!
//! why: define all raft rpc message types for server communication
//! relations: produced and consumed by the raft server, carried by RpcClient implementations
//! what: MsgType codes, ReqMsg and RespMsg envelopes

use crate::cluster_config::ServerId;
use crate::log_entry::LogEntry;

/// Every request and response kind exchanged between servers.
///
/// The discriminants are stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Candidate asking for a vote
    RequestVoteRequest = 1,
    RequestVoteResponse = 2,
    /// Log replication, also the heartbeat when it carries no entries
    AppendEntriesRequest = 3,
    AppendEntriesResponse = 4,
    /// Application command submitted to the cluster
    ClientRequest = 5,
    AddServerRequest = 6,
    AddServerResponse = 7,
    RemoveServerRequest = 8,
    RemoveServerResponse = 9,
    /// Batch of packed log entries sent to a joining server
    SyncLogRequest = 10,
    SyncLogResponse = 11,
    /// Leader inviting a new server into the cluster
    JoinClusterRequest = 12,
    JoinClusterResponse = 13,
    /// Leader asking a member to step down before removal
    LeaveClusterRequest = 14,
    LeaveClusterResponse = 15,
    InstallSnapshotRequest = 16,
    InstallSnapshotResponse = 17,
}

impl MsgType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use MsgType::*;
        Ok(match code {
            1 => RequestVoteRequest,
            2 => RequestVoteResponse,
            3 => AppendEntriesRequest,
            4 => AppendEntriesResponse,
            5 => ClientRequest,
            6 => AddServerRequest,
            7 => AddServerResponse,
            8 => RemoveServerRequest,
            9 => RemoveServerResponse,
            10 => SyncLogRequest,
            11 => SyncLogResponse,
            12 => JoinClusterRequest,
            13 => JoinClusterResponse,
            14 => LeaveClusterRequest,
            15 => LeaveClusterResponse,
            16 => InstallSnapshotRequest,
            17 => InstallSnapshotResponse,
            other => return Err(other),
        })
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqMsg {
    term: u64,
    msg_type: MsgType,
    src: ServerId,
    dst: ServerId,
    last_log_term: u64,
    last_log_idx: u64,
    commit_idx: u64,
    log_entries: Vec<LogEntry>,
}

impl ReqMsg {
    pub fn new(
        term: u64,
        msg_type: MsgType,
        src: ServerId,
        dst: ServerId,
        last_log_term: u64,
        last_log_idx: u64,
        commit_idx: u64,
    ) -> Self {
        Self {
            term,
            msg_type,
            src,
            dst,
            last_log_term,
            last_log_idx,
            commit_idx,
            log_entries: Vec::new(),
        }
    }

    /// Client-facing request carrying `entries`, addressed to `dst`.
    pub fn client(msg_type: MsgType, dst: ServerId, entries: Vec<LogEntry>) -> Self {
        Self::new(0, msg_type, 0, dst, 0, 0, 0).with_entries(entries)
    }

    pub fn with_entries(mut self, entries: Vec<LogEntry>) -> Self {
        self.log_entries = entries;
        self
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn src(&self) -> ServerId {
        self.src
    }

    pub fn dst(&self) -> ServerId {
        self.dst
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }

    pub fn last_log_idx(&self) -> u64 {
        self.last_log_idx
    }

    pub fn commit_idx(&self) -> u64 {
        self.commit_idx
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log_entries
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespMsg {
    term: u64,
    msg_type: MsgType,
    src: ServerId,
    dst: ServerId,
    next_idx: u64,
    accepted: bool,
}

impl RespMsg {
    /// A not-yet-accepted response; call [`RespMsg::accept`] to grant it.
    pub fn new(term: u64, msg_type: MsgType, src: ServerId, dst: ServerId) -> Self {
        Self {
            term,
            msg_type,
            src,
            dst,
            next_idx: 0,
            accepted: false,
        }
    }

    pub fn accept(&mut self, next_idx: u64) {
        self.next_idx = next_idx;
        self.accepted = true;
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn src(&self) -> ServerId {
        self.src
    }

    /// For rejected client requests this is the known leader, or -1.
    pub fn dst(&self) -> ServerId {
        self.dst
    }

    pub fn next_idx(&self) -> u64 {
        self.next_idx
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }
}
