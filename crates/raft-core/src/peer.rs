//! # peer
//!
//! why: the leader tracks replication progress and rpc pacing per follower
//! relations: owned by the raft server, sends through an RpcClient, heartbeats via the scheduler
//! what: Peer session state, busy gate, heartbeat backoff, outbound request envelope

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cluster_config::{ServerId, SrvConfig};
use crate::message::{MsgType, ReqMsg};
use crate::params::RaftParams;
use crate::rpc::RpcClient;
use crate::scheduler::{DelayedTask, DelayedTaskScheduler};
use crate::snapshot::{Snapshot, SnapshotSyncCtx};

/// Which response path a completed request goes back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Votes, replication and snapshot sync to cluster members
    Replication,
    /// Membership traffic: join, log sync, leave
    Extended,
}

/// A request queued while the server lock is held, sent after release.
pub(crate) struct Outgoing {
    pub(crate) client: Arc<dyn RpcClient>,
    pub(crate) req: ReqMsg,
    pub(crate) route: Route,
}

/// Leader-side view of one other server
pub struct Peer {
    config: SrvConfig,
    rpc: Arc<dyn RpcClient>,
    scheduler: Arc<dyn DelayedTaskScheduler>,
    hb_task: Arc<DelayedTask>,
    hb_interval: u64,
    current_hb_interval: u64,
    rpc_backoff: u64,
    max_hb_interval: u64,
    next_log_idx: u64,
    matched_idx: u64,
    busy: AtomicBool,
    pending_commit: AtomicBool,
    hb_enabled: bool,
    snp_sync_ctx: Option<SnapshotSyncCtx>,
}

impl Peer {
    pub fn new(
        config: SrvConfig,
        rpc: Arc<dyn RpcClient>,
        scheduler: Arc<dyn DelayedTaskScheduler>,
        params: &RaftParams,
        hb_exec: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            rpc,
            scheduler,
            hb_task: DelayedTask::new(hb_exec),
            hb_interval: params.heart_beat_interval,
            current_hb_interval: params.heart_beat_interval,
            rpc_backoff: params.rpc_failure_backoff,
            max_hb_interval: params.max_hb_interval(),
            next_log_idx: 0,
            matched_idx: 0,
            busy: AtomicBool::new(false),
            pending_commit: AtomicBool::new(false),
            hb_enabled: false,
            snp_sync_ctx: None,
        }
    }

    pub fn id(&self) -> ServerId {
        self.config.id()
    }

    pub fn config(&self) -> &SrvConfig {
        &self.config
    }

    /// Claim the single in-flight replication slot. False if already taken.
    pub fn make_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_free(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Remember that a commit advance still has to reach this peer.
    pub fn set_pending_commit(&self) {
        self.pending_commit.store(true, Ordering::Release);
    }

    /// Consume the pending commit flag; true if it was set.
    pub fn clear_pending_commit(&self) -> bool {
        self.pending_commit
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn next_log_idx(&self) -> u64 {
        self.next_log_idx
    }

    pub fn set_next_log_idx(&mut self, idx: u64) {
        self.next_log_idx = idx;
    }

    pub fn matched_idx(&self) -> u64 {
        self.matched_idx
    }

    pub fn set_matched_idx(&mut self, idx: u64) {
        self.matched_idx = idx;
    }

    pub fn current_hb_interval(&self) -> u64 {
        self.current_hb_interval
    }

    pub fn max_hb_interval(&self) -> u64 {
        self.max_hb_interval
    }

    pub fn slow_down_hb(&mut self) {
        self.current_hb_interval = (self.current_hb_interval + self.rpc_backoff).min(self.max_hb_interval);
    }

    pub fn resume_hb_speed(&mut self) {
        self.current_hb_interval = self.hb_interval;
    }

    pub fn is_hb_enabled(&self) -> bool {
        self.hb_enabled
    }

    /// Turning heartbeats off also cancels the pending heartbeat timer.
    pub fn enable_hb(&mut self, enable: bool) {
        self.hb_enabled = enable;
        if !enable {
            self.scheduler.cancel(&self.hb_task);
        }
    }

    /// Enable heartbeats at full speed and arm the first one.
    pub fn start_heartbeat(&mut self) {
        self.enable_hb(true);
        self.resume_hb_speed();
        self.schedule_next_hb();
    }

    pub fn schedule_next_hb(&self) {
        self.scheduler.schedule(&self.hb_task, self.current_hb_interval);
    }

    pub fn snapshot_sync_ctx(&self) -> Option<&SnapshotSyncCtx> {
        self.snp_sync_ctx.as_ref()
    }

    pub fn snapshot_sync_ctx_mut(&mut self) -> Option<&mut SnapshotSyncCtx> {
        self.snp_sync_ctx.as_mut()
    }

    /// Start a transfer of `snapshot` from offset 0, or end the transfer.
    pub fn set_snapshot_in_sync(&mut self, snapshot: Option<Arc<Snapshot>>) {
        self.snp_sync_ctx = snapshot.map(SnapshotSyncCtx::new);
    }

    pub(crate) fn send_req(&self, req: ReqMsg, route: Route) -> Outgoing {
        Outgoing {
            client: Arc::clone(&self.rpc),
            req,
            route,
        }
    }

    /// Bookkeeping when a request to this peer completes, before the
    /// response itself is handled.
    pub(crate) fn handle_rpc_result(&mut self, msg_type: MsgType, succeeded: bool) {
        if matches!(
            msg_type,
            MsgType::AppendEntriesRequest | MsgType::InstallSnapshotRequest
        ) {
            self.set_free();
        }
        if succeeded {
            self.resume_hb_speed();
        } else {
            self.slow_down_hb();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("next_log_idx", &self.next_log_idx)
            .field("matched_idx", &self.matched_idx)
            .field("busy", &self.is_busy())
            .field("hb_enabled", &self.hb_enabled)
            .finish()
    }
}
