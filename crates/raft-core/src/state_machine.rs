//! # state_machine
//!
//! why: raft orders commands, the application gives them meaning
//! relations: driven by the raft server's commit worker and snapshot sync
//! what: StateMachine trait and the snapshot completion callback type

use std::sync::Arc;

use crate::error::SnapshotError;
use crate::snapshot::Snapshot;

/// Called once a snapshot has been materialized; `Ok(false)` means the
/// state machine declined to create it.
pub type SnapshotHandler = Box<dyn FnOnce(Result<bool, SnapshotError>) + Send>;

/// Application state driven by the replicated log.
pub trait StateMachine: Send + Sync {
    /// Apply a committed application entry.
    fn commit(&self, log_idx: u64, data: &[u8]);

    /// Entry appended locally but not yet committed.
    fn pre_commit(&self, log_idx: u64, data: &[u8]);

    /// A pre-committed entry was overwritten by the leader.
    fn rollback(&self, log_idx: u64, data: &[u8]);

    /// Store a received chunk of a snapshot image at `offset`.
    fn save_snapshot_data(&self, snapshot: &Snapshot, offset: u64, data: &[u8]);

    /// Replace the state with a fully received snapshot.
    fn apply_snapshot(&self, snapshot: &Snapshot) -> bool;

    /// Fill `buf` from the image at `offset`; returns the number of bytes read.
    fn read_snapshot_data(&self, snapshot: &Snapshot, offset: u64, buf: &mut [u8]) -> usize;

    fn last_snapshot(&self) -> Option<Arc<Snapshot>>;

    /// Start materializing `snapshot` and report through `when_done`, possibly
    /// from another thread.
    fn create_snapshot(&self, snapshot: Arc<Snapshot>, when_done: SnapshotHandler);
}
