//! # params
//!
//! why: timing and batching knobs differ between deployments and tests
//! relations: held by Context, read by the raft server and peers
//! what: RaftParams with serde defaults and builder setters

use serde::{Deserialize, Serialize};

/// Snapshot chunk size used when `snapshot_block_size` is 0
pub const DEFAULT_SNAPSHOT_BLOCK_SIZE: u32 = 4096;

/// Tunables of a raft server. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftParams {
    pub election_timeout_upper_bound: u64,
    pub election_timeout_lower_bound: u64,
    pub heart_beat_interval: u64,
    /// Added to a peer's heartbeat interval after each failed rpc
    pub rpc_failure_backoff: u64,
    /// Max entries in one AppendEntries request
    pub max_append_size: u64,
    /// Max entries in one log pack sent to a joining server
    pub log_sync_batch_size: u64,
    /// A joining server is admitted once it lags fewer entries than this
    pub log_sync_stop_gap: u64,
    /// Committed entries between snapshots; 0 disables snapshots
    pub snapshot_distance: u64,
    /// Snapshot chunk size in bytes; 0 selects the default
    pub snapshot_block_size: u32,
}

impl Default for RaftParams {
    fn default() -> Self {
        Self {
            election_timeout_upper_bound: 300,
            election_timeout_lower_bound: 150,
            heart_beat_interval: 75,
            rpc_failure_backoff: 25,
            max_append_size: 100,
            log_sync_batch_size: 1000,
            log_sync_stop_gap: 10,
            snapshot_distance: 0,
            snapshot_block_size: 0,
        }
    }
}

impl RaftParams {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_election_timeout_lower(mut self, ms: u64) -> Self {
        self.election_timeout_lower_bound = ms;
        self
    }

    pub fn with_election_timeout_upper(mut self, ms: u64) -> Self {
        self.election_timeout_upper_bound = ms;
        self
    }

    pub fn with_hb_interval(mut self, ms: u64) -> Self {
        self.heart_beat_interval = ms;
        self
    }

    pub fn with_rpc_failure_backoff(mut self, ms: u64) -> Self {
        self.rpc_failure_backoff = ms;
        self
    }

    pub fn with_max_append_size(mut self, size: u64) -> Self {
        self.max_append_size = size;
        self
    }

    pub fn with_log_sync_batch_size(mut self, size: u64) -> Self {
        self.log_sync_batch_size = size;
        self
    }

    pub fn with_log_sync_stop_gap(mut self, gap: u64) -> Self {
        self.log_sync_stop_gap = gap;
        self
    }

    pub fn with_snapshot_distance(mut self, distance: u64) -> Self {
        self.snapshot_distance = distance;
        self
    }

    pub fn with_snapshot_block_size(mut self, size: u32) -> Self {
        self.snapshot_block_size = size;
        self
    }

    /// Upper bound for a backed-off heartbeat; stays below the election
    /// timeout so followers do not start elections while a leader backs off.
    pub fn max_hb_interval(&self) -> u64 {
        self.heart_beat_interval.max(
            self.election_timeout_lower_bound
                .saturating_sub(self.heart_beat_interval / 2),
        )
    }

    pub fn snapshot_block_size(&self) -> u32 {
        if self.snapshot_block_size == 0 {
            DEFAULT_SNAPSHOT_BLOCK_SIZE
        } else {
            self.snapshot_block_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let params = RaftParams::default();
        assert_eq!(params.election_timeout_lower_bound, 150);
        assert_eq!(params.election_timeout_upper_bound, 300);
        assert_eq!(params.snapshot_block_size(), 4096);
        assert_eq!(params.max_hb_interval(), 150 - 37);
    }

    #[test]
    fn max_hb_interval_never_below_hb() {
        let params = RaftParams::default()
            .with_hb_interval(200)
            .with_election_timeout_lower(100);
        assert_eq!(params.max_hb_interval(), 200);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let params = RaftParams::from_json(r#"{"heart_beat_interval": 20, "snapshot_distance": 50}"#)
            .unwrap();
        assert_eq!(params.heart_beat_interval, 20);
        assert_eq!(params.snapshot_distance, 50);
        assert_eq!(params.log_sync_stop_gap, 10);
    }
}
