//! Shipping snapshots to peers that fell behind the retained log, and
//! installing them on the receiving side.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{RaftServer, ServerCore, SrvRole};
use crate::error::RaftError;
use crate::log_entry::{LogEntry, LogValType};
use crate::message::{MsgType, ReqMsg, RespMsg};
use crate::peer::Peer;
use crate::snapshot::SnapshotSyncReq;

impl RaftServer {
    /// Next chunk of the latest snapshot for `peer`, which needs entries up
    /// to `last_log_idx` that the log no longer holds.
    pub(super) fn create_sync_snapshot_req(
        &self,
        peer: &mut Peer,
        last_log_idx: u64,
        term: u64,
        commit_idx: u64,
    ) -> Result<ReqMsg, RaftError> {
        let latest = self.ctx.state_machine.last_snapshot();
        let in_sync = peer.snapshot_sync_ctx().map(|ctx| Arc::clone(ctx.snapshot()));
        let stale = match (&in_sync, &latest) {
            (None, _) => true,
            (Some(current), Some(latest)) => latest.last_log_idx() > current.last_log_idx(),
            (Some(_), None) => false,
        };

        if stale {
            let snapshot = latest.ok_or_else(|| {
                RaftError::fatal(format!(
                    "no snapshot could be found while no log is available for peer {}",
                    peer.id()
                ))
            })?;
            if last_log_idx > snapshot.last_log_idx() {
                return Err(RaftError::fatal(format!(
                    "the latest snapshot {} is older than peer {} needs ({last_log_idx})",
                    snapshot.last_log_idx(),
                    peer.id()
                )));
            }
            if snapshot.size() < 1 {
                return Err(RaftError::fatal("invalid snapshot, size is less than 1"));
            }
            info!(
                id = self.id,
                peer = peer.id(),
                snapshot = snapshot.last_log_idx(),
                "trying to sync snapshot to peer"
            );
            peer.set_snapshot_in_sync(Some(snapshot));
        }

        let (snapshot, offset) = match peer.snapshot_sync_ctx() {
            Some(ctx) => (Arc::clone(ctx.snapshot()), ctx.offset()),
            None => return Err(RaftError::fatal("snapshot sync context vanished")),
        };

        let size_left = snapshot.size().saturating_sub(offset);
        let block = u64::from(self.ctx.params.snapshot_block_size()).min(size_left) as usize;
        let mut data = vec![0u8; block];
        let read = self
            .ctx
            .state_machine
            .read_snapshot_data(&snapshot, offset, &mut data);
        if read < block {
            return Err(RaftError::fatal(format!(
                "only {read} bytes could be read from the snapshot while {block} bytes are expected"
            )));
        }

        let done = offset + block as u64 >= snapshot.size();
        debug!(
            id = self.id,
            peer = peer.id(),
            offset,
            block,
            done,
            "snapshot sync request"
        );
        let sync_req = SnapshotSyncReq::new(Arc::clone(&snapshot), offset, data, done);
        let entry = LogEntry::new(term, sync_req.serialize()?.into_vec(), LogValType::SnpSyncReq);
        Ok(ReqMsg::new(
            term,
            MsgType::InstallSnapshotRequest,
            self.id,
            peer.id(),
            snapshot.last_log_term(),
            snapshot.last_log_idx(),
            commit_idx,
        )
        .with_entries(vec![entry]))
    }

    pub(super) fn handle_install_snapshot_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        if req.term() == core.state.term() && !core.catching_up {
            match core.role {
                SrvRole::Candidate => self.become_follower(core),
                SrvRole::Leader => {
                    return Err(RaftError::fatal(format!(
                        "received install snapshot request from another leader ({}) with the same term {}",
                        req.src(),
                        req.term()
                    )))
                }
                SrvRole::Follower => self.restart_election_timer(core),
            }
        }

        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::InstallSnapshotResponse,
            self.id,
            req.src(),
        );
        if !core.catching_up && req.term() < core.state.term() {
            info!(id = self.id, "received an install snapshot request from a lower term, decline");
            return Ok(resp);
        }

        let entries = req.log_entries();
        if entries.len() != 1 || entries[0].value_type() != LogValType::SnpSyncReq {
            warn!(id = self.id, "invalid install snapshot request, bad log entries");
            return Ok(resp);
        }
        let sync_req = match SnapshotSyncReq::from_bytes(entries[0].payload()) {
            Ok(sync_req) => sync_req,
            Err(err) => {
                warn!(id = self.id, %err, "invalid snapshot sync request");
                return Ok(resp);
            }
        };

        if sync_req.snapshot().last_log_idx() <= core.quick_commit_idx {
            warn!(
                id = self.id,
                snapshot = sync_req.snapshot().last_log_idx(),
                commit_idx = core.quick_commit_idx,
                "received a snapshot that is not newer than the commit index"
            );
            return Ok(resp);
        }

        if self.handle_snapshot_sync_req(core, &sync_req)? {
            resp.accept(sync_req.offset() + sync_req.data().len() as u64);
        }
        Ok(resp)
    }

    /// Store one chunk; the last chunk installs the snapshot. Returns false if
    /// the snapshot could not be installed.
    fn handle_snapshot_sync_req(&self, core: &mut ServerCore, sync_req: &SnapshotSyncReq) -> Result<bool, RaftError> {
        let snapshot = sync_req.snapshot();
        self.ctx
            .state_machine
            .save_snapshot_data(snapshot, sync_req.offset(), sync_req.data());
        if !sync_req.is_done() {
            return Ok(true);
        }

        if core.role != SrvRole::Follower {
            return Err(RaftError::fatal("bad server role for applying a snapshot"));
        }

        let last_idx = snapshot.last_log_idx();
        info!(id = self.id, snapshot = last_idx, "successfully receive a snapshot from leader");
        if !self.log_store.compact(last_idx) {
            error!(id = self.id, snapshot = last_idx, "failed to compact the log store after receiving a snapshot");
            return Ok(false);
        }

        self.stop_election_timer();
        if !self.ctx.state_machine.apply_snapshot(snapshot) {
            return Err(RaftError::fatal("failed to apply the snapshot after log compacted"));
        }

        self.reconfigure(core, Arc::clone(snapshot.last_config()))?;
        self.ctx.state_mgr.save_config(&core.config)?;
        core.state.set_commit_idx(last_idx);
        core.quick_commit_idx = core.quick_commit_idx.max(last_idx);
        self.commit_signal.jump_to(last_idx);
        self.ctx.state_mgr.save_state(&core.state)?;
        info!(id = self.id, snapshot = last_idx, "snapshot is successfully applied");
        self.restart_election_timer(core);
        Ok(true)
    }

    pub(super) fn handle_install_snapshot_resp(&self, core: &mut ServerCore, resp: &RespMsg) -> Result<(), RaftError> {
        if core.role != SrvRole::Leader {
            return Ok(());
        }
        let next_slot = self.log_store.next_slot();
        let Some(peer) = core.peers.get_mut(&resp.src()) else {
            info!(id = self.id, peer = resp.src(), "the response is from an unknown peer");
            return Ok(());
        };

        let mut need_to_catchup = true;
        if resp.accepted() {
            let progress = peer
                .snapshot_sync_ctx()
                .map(|ctx| (ctx.snapshot().size(), ctx.snapshot().last_log_idx()));
            match progress {
                None => {
                    info!(id = self.id, peer = resp.src(), "no snapshot sync context, drop the response");
                    need_to_catchup = false;
                }
                Some((size, last_idx)) if resp.next_idx() >= size => {
                    debug!(id = self.id, peer = resp.src(), "snapshot sync is done");
                    peer.set_next_log_idx(last_idx + 1);
                    peer.set_matched_idx(last_idx);
                    peer.set_snapshot_in_sync(None);
                    need_to_catchup = peer.clear_pending_commit() || peer.next_log_idx() < next_slot;
                }
                Some(_) => {
                    if let Some(ctx) = peer.snapshot_sync_ctx_mut() {
                        ctx.set_offset(resp.next_idx());
                    }
                }
            }
        } else {
            info!(id = self.id, peer = resp.src(), "peer declined to install the snapshot, will retry");
        }

        if need_to_catchup {
            self.request_append_entries_for(core, resp.src())?;
        }
        Ok(())
    }
}
