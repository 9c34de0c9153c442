//! Background application of committed entries, plus the snapshot trigger
//! that runs after each one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{RaftServer, ServerCore, SrvRole};
use crate::cluster_config::ClusterConfig;
use crate::error::{LogStoreError, RaftError, SnapshotError};
use crate::log::LogStore;
use crate::log_entry::{LogEntry, LogValType};
use crate::snapshot::Snapshot;

struct Progress {
    /// Highest index the worker may apply
    target: u64,
    /// Highest index handed to the state machine
    applied: u64,
    /// Bumped on every `advance_target`, retries wait for it to move
    kicks: u64,
    /// `kicks` seen when the last pass failed
    stalled_at: Option<u64>,
    stopping: bool,
}

/// Wakes the commit worker when the commit target moves.
pub(super) struct CommitSignal {
    progress: Mutex<Progress>,
    wake: Condvar,
}

impl CommitSignal {
    pub(super) fn new(applied: u64) -> Self {
        Self {
            progress: Mutex::new(Progress {
                target: applied,
                applied,
                kicks: 0,
                stalled_at: None,
                stopping: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub(super) fn advance_target(&self, target: u64) {
        let mut progress = self.progress.lock();
        progress.kicks = progress.kicks.wrapping_add(1);
        if target > progress.target {
            progress.target = target;
        }
        if progress.applied < progress.target {
            self.wake.notify_one();
        }
    }

    /// A snapshot covered everything up to `idx`.
    pub(super) fn jump_to(&self, idx: u64) {
        let mut progress = self.progress.lock();
        progress.applied = progress.applied.max(idx);
        progress.target = progress.target.max(idx);
    }

    pub(super) fn stop(&self) {
        self.progress.lock().stopping = true;
        self.wake.notify_all();
    }

    /// Block until there is something to apply and return the kick count
    /// the pass starts from. None once stopping.
    fn wait_for_work(&self, log_store: &dyn LogStore) -> Option<u64> {
        let mut progress = self.progress.lock();
        loop {
            if progress.stopping {
                return None;
            }
            let limit = progress.target.min(log_store.next_slot() - 1);
            let stalled = progress.stalled_at == Some(progress.kicks);
            if progress.applied < limit && !stalled {
                progress.stalled_at = None;
                return Some(progress.kicks);
            }
            self.wake.wait(&mut progress);
        }
    }

    fn next_to_apply(&self, log_store: &dyn LogStore) -> Option<u64> {
        let progress = self.progress.lock();
        let limit = progress.target.min(log_store.next_slot() - 1);
        (!progress.stopping && progress.applied < limit).then_some(progress.applied + 1)
    }

    /// The pass started at `kicks` failed; hold off until the next `advance_target`.
    fn stall(&self, kicks: u64) {
        self.progress.lock().stalled_at = Some(kicks);
    }

    /// Record `idx` as applied unless a snapshot moved past it meanwhile.
    fn mark_applied(&self, idx: u64) -> bool {
        let mut progress = self.progress.lock();
        if progress.applied + 1 != idx {
            return false;
        }
        progress.applied = idx;
        true
    }
}

fn run_commit_worker(signal: Arc<CommitSignal>, log_store: Arc<dyn LogStore>, server: Weak<RaftServer>) {
    while let Some(kicks) = signal.wait_for_work(log_store.as_ref()) {
        let Some(server) = server.upgrade() else {
            break;
        };
        match server.apply_committed() {
            Ok(()) => {}
            Err(RaftError::ShutDown) => break,
            Err(err) if err.is_fatal() => {
                let _ = server.supervise::<()>(Err(err));
                break;
            }
            Err(err) => {
                warn!(id = server.id(), %err, "failed to apply committed entries, retry on the next commit");
                signal.stall(kicks);
            }
        }
    }
    debug!("commit worker exits");
}

/// Completion of `StateMachine::create_snapshot`. Touches only the log store
/// and the in-progress gate, never the server lock.
fn on_snapshot_created(
    log_store: &dyn LogStore,
    gate: &AtomicBool,
    snapshot: &Snapshot,
    result: Result<bool, SnapshotError>,
) {
    match result {
        Ok(true) => {
            debug!(
                idx = snapshot.last_log_idx(),
                "snapshot created, compact the log store"
            );
            if !log_store.compact(snapshot.last_log_idx()) {
                warn!(idx = snapshot.last_log_idx(), "failed to compact the log store");
            }
        }
        Ok(false) => info!(idx = snapshot.last_log_idx(), "state machine declined to create a snapshot"),
        Err(err) => error!(%err, idx = snapshot.last_log_idx(), "failed to create a snapshot"),
    }
    gate.store(false, Ordering::Release);
}

impl RaftServer {
    pub(super) fn start_commit_worker(&self) -> Result<(), RaftError> {
        let signal = Arc::clone(&self.commit_signal);
        let log_store = Arc::clone(&self.log_store);
        let server = self.weak_self.clone();
        let worker = thread::Builder::new()
            .name(format!("raft-commit-{}", self.id))
            .spawn(move || run_commit_worker(signal, log_store, server))?;
        *self.commit_worker.lock() = Some(worker);
        Ok(())
    }

    /// Raise the known commit index to `target` and let the worker apply it.
    /// The leader also pushes the new index to its followers.
    pub(super) fn commit(&self, core: &mut ServerCore, target: u64) -> Result<(), RaftError> {
        if target > core.quick_commit_idx {
            core.quick_commit_idx = target;
            if core.role == SrvRole::Leader {
                let ids: Vec<_> = core.peers.keys().copied().collect();
                for peer_id in ids {
                    if !self.request_append_entries_for(core, peer_id)? {
                        if let Some(peer) = core.peers.get(&peer_id) {
                            peer.set_pending_commit();
                        }
                    }
                }
            }
        }
        self.commit_signal.advance_target(core.quick_commit_idx);
        Ok(())
    }

    /// Apply everything that is committed and present in the log.
    fn apply_committed(&self) -> Result<(), RaftError> {
        while let Some(idx) = self.commit_signal.next_to_apply(self.log_store.as_ref()) {
            let entry = match self.log_store.entry_at(idx) {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(()),
                // a snapshot is being installed under us, the applied index will move
                Err(LogStoreError::Compacted { .. }) => {
                    thread::yield_now();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match entry.value_type() {
                LogValType::AppLog => self.ctx.state_machine.commit(idx, entry.payload()),
                LogValType::Conf => self.with_core(|core| self.commit_config(core, idx, &entry))?,
                _ => {}
            }

            if !self.commit_signal.mark_applied(idx) {
                continue;
            }
            self.with_core(|core| {
                core.state.set_commit_idx(idx);
                self.ctx.state_mgr.save_state(&core.state)?;
                self.snapshot_and_compact(core, idx)
            })?;
        }
        Ok(())
    }

    fn commit_config(&self, core: &mut ServerCore, idx: u64, entry: &LogEntry) -> Result<(), RaftError> {
        let new_config = Arc::new(ClusterConfig::from_bytes(entry.payload())?);
        info!(id = self.id, idx, "configuration is committed");
        self.ctx.state_mgr.save_config(&new_config)?;
        core.config_changing = false;
        if core.config.log_idx() < new_config.log_idx() {
            self.reconfigure(core, Arc::clone(&new_config))?;
        }
        if core.catching_up && new_config.contains(self.id) {
            info!(id = self.id, "this server is committed as one of cluster members");
            core.catching_up = false;
            self.restart_election_timer(core);
        }
        Ok(())
    }

    fn snapshot_and_compact(&self, core: &mut ServerCore, committed_idx: u64) -> Result<(), RaftError> {
        let distance = self.ctx.params.snapshot_distance;
        if distance == 0 || committed_idx.saturating_sub(self.log_store.start_index()) <= distance {
            return Ok(());
        }
        if self
            .snp_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let result = self.create_snapshot(core, committed_idx);
        if result.is_err() {
            self.snp_in_progress.store(false, Ordering::Release);
        }
        result
    }

    fn create_snapshot(&self, core: &ServerCore, committed_idx: u64) -> Result<(), RaftError> {
        let distance = self.ctx.params.snapshot_distance;
        if let Some(last) = self.ctx.state_machine.last_snapshot() {
            if committed_idx.saturating_sub(last.last_log_idx()) < distance {
                info!(
                    id = self.id,
                    idx = committed_idx,
                    last = last.last_log_idx(),
                    "a very recent snapshot is available, skip this one"
                );
                self.snp_in_progress.store(false, Ordering::Release);
                return Ok(());
            }
        }

        info!(id = self.id, idx = committed_idx, "creating a snapshot");
        let config = self.config_at(core, committed_idx)?;
        let term = self.term_for_log(committed_idx)?;
        let snapshot = Arc::new(Snapshot::new(committed_idx, term, config, 0));

        let log_store = Arc::clone(&self.log_store);
        let gate = Arc::clone(&self.snp_in_progress);
        let created = Arc::clone(&snapshot);
        self.ctx.state_machine.create_snapshot(
            snapshot,
            Box::new(move |result| on_snapshot_created(log_store.as_ref(), &gate, &created, result)),
        );
        Ok(())
    }

    /// Configuration in effect at `idx`, found by walking the chain back from
    /// the active one.
    fn config_at(&self, core: &ServerCore, idx: u64) -> Result<Arc<ClusterConfig>, RaftError> {
        let start = self.log_store.start_index();
        let mut config = Arc::clone(&core.config);
        while config.log_idx() > idx && config.prev_log_idx() >= start {
            let prev = config.prev_log_idx();
            let entry = self.log_store.entry_at(prev)?.ok_or_else(|| {
                RaftError::fatal(format!("configuration entry {prev} is missing from the log"))
            })?;
            config = Arc::new(ClusterConfig::from_bytes(entry.payload())?);
        }

        if config.log_idx() > idx {
            if config.prev_log_idx() > 0 && config.prev_log_idx() < start {
                let snapshot = self.ctx.state_machine.last_snapshot().ok_or_else(|| {
                    RaftError::fatal("no snapshot holds the configuration preceding the log")
                })?;
                return Ok(Arc::clone(snapshot.last_config()));
            }
            return Err(RaftError::fatal(format!(
                "no configuration could be found for log index {idx}"
            )));
        }
        Ok(config)
    }
}
