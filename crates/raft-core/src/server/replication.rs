//! Log replication: AppendEntries in both directions, client requests,
//! heartbeats and response routing.

use tracing::{debug, info};

use super::{RaftServer, ServerCore, SrvRole};
use crate::cluster_config::{ClusterConfig, ServerId};
use crate::error::{RaftError, RpcError};
use crate::log_entry::{LogEntry, LogValType};
use crate::message::{MsgType, ReqMsg, RespMsg};
use crate::peer::{Peer, Route};

impl RaftServer {
    pub(super) fn handle_append_entries(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        if req.term() == core.state.term() {
            match core.role {
                SrvRole::Candidate => self.become_follower(core),
                SrvRole::Leader => {
                    return Err(RaftError::fatal(format!(
                        "received append entries request from another leader ({}) with the same term {}",
                        req.src(),
                        req.term()
                    )))
                }
                SrvRole::Follower => self.restart_election_timer(core),
            }
        }

        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::AppendEntriesResponse,
            self.id,
            req.src(),
        );

        let log_okay = req.last_log_idx() == 0
            || self.log_term_if_known(req.last_log_idx()) == Some(req.last_log_term());
        if req.term() < core.state.term() || !log_okay {
            debug!(
                id = self.id,
                last_log_idx = req.last_log_idx(),
                last_log_term = req.last_log_term(),
                "reject append entries"
            );
            return Ok(resp);
        }

        let entries = req.log_entries();
        let mut idx = req.last_log_idx() + 1;
        let mut i = 0;

        // already compacted here, hence committed and matching
        let start = self.log_store.start_index();
        while idx < start && i < entries.len() {
            idx += 1;
            i += 1;
        }

        while idx < self.log_store.next_slot()
            && i < entries.len()
            && self.log_store.term_at(idx) == entries[i].term()
        {
            idx += 1;
            i += 1;
        }

        // first divergent entry: write_at drops everything from idx on
        if idx < self.log_store.next_slot() && i < entries.len() {
            self.discard_tail(core, idx)?;
            self.log_store.write_at(idx, &entries[i])?;
            self.on_entry_stored(core, idx, &entries[i])?;
            i += 1;
        }

        for entry in &entries[i..] {
            let idx = self.log_store.append(entry)?;
            self.on_entry_stored(core, idx, entry)?;
        }

        core.leader = Some(req.src());
        let last_new_idx = req.last_log_idx() + entries.len() as u64;
        self.commit(core, req.commit_idx().min(last_new_idx))?;
        resp.accept(last_new_idx + 1);
        Ok(resp)
    }

    /// Undo the log tail starting at `idx` before it is overwritten: roll
    /// back app entries newest first, and fall back to the committed
    /// configuration if the active one lives in the tail.
    fn discard_tail(&self, core: &mut ServerCore, idx: u64) -> Result<(), RaftError> {
        let dropped = self.log_store.entries(idx, self.log_store.next_slot())?;
        for (offset, old) in dropped.iter().enumerate().rev() {
            if old.value_type() == LogValType::AppLog {
                self.ctx.state_machine.rollback(idx + offset as u64, old.payload());
            }
        }
        if idx <= core.config.log_idx() {
            info!(id = self.id, idx, config_idx = core.config.log_idx(), "revert a configuration change");
            let committed = self.ctx.state_mgr.load_config()?;
            self.reconfigure(core, committed)?;
            core.config_changing = false;
        }
        Ok(())
    }

    fn on_entry_stored(&self, core: &mut ServerCore, idx: u64, entry: &LogEntry) -> Result<(), RaftError> {
        match entry.value_type() {
            LogValType::AppLog => self.ctx.state_machine.pre_commit(idx, entry.payload()),
            LogValType::Conf => {
                info!(id = self.id, idx, "receive a config change from leader");
                let config = ClusterConfig::from_bytes(entry.payload())?;
                core.config_changing = true;
                self.reconfigure(core, config.into_shared())?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(super) fn handle_cli_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::AppendEntriesResponse,
            self.id,
            core.leader.unwrap_or(-1),
        );
        if core.role != SrvRole::Leader {
            return Ok(resp);
        }

        let term = core.state.term();
        for entry in req.log_entries() {
            let entry = LogEntry::app(term, entry.payload().to_vec());
            let idx = self.log_store.append(&entry)?;
            self.ctx.state_machine.pre_commit(idx, entry.payload());
        }

        self.request_append_entries(core)?;
        resp.accept(self.log_store.next_slot());
        Ok(resp)
    }

    /// Send AppendEntries to every peer; a single-server cluster commits right away.
    pub(super) fn request_append_entries(&self, core: &mut ServerCore) -> Result<(), RaftError> {
        if core.peers.is_empty() {
            return self.commit(core, self.last_log_idx());
        }
        let ids: Vec<ServerId> = core.peers.keys().copied().collect();
        for peer_id in ids {
            self.request_append_entries_for(core, peer_id)?;
        }
        Ok(())
    }

    /// Queue one AppendEntries (or snapshot chunk) for `peer_id`. Returns
    /// false if the peer already has a request in flight.
    pub(super) fn request_append_entries_for(&self, core: &mut ServerCore, peer_id: ServerId) -> Result<bool, RaftError> {
        match core.peers.get(&peer_id) {
            Some(peer) if peer.make_busy() => {}
            Some(_) => {
                debug!(id = self.id, peer = peer_id, "server is busy, skip the request");
                return Ok(false);
            }
            None => return Ok(false),
        }

        let term = core.state.term();
        let commit_idx = core.quick_commit_idx;
        let Some(peer) = core.peers.get_mut(&peer_id) else {
            return Ok(false);
        };
        match self.create_append_entries_req(peer, term, commit_idx) {
            Ok(req) => {
                let out = peer.send_req(req, Route::Replication);
                core.outbox.push(out);
                Ok(true)
            }
            Err(err) => {
                peer.set_free();
                Err(err)
            }
        }
    }

    fn create_append_entries_req(&self, peer: &mut Peer, term: u64, commit_idx: u64) -> Result<ReqMsg, RaftError> {
        let start_idx = self.log_store.start_index();
        let cur_nxt_idx = self.log_store.next_slot();
        if peer.next_log_idx() == 0 {
            peer.set_next_log_idx(cur_nxt_idx);
        }

        let last_log_idx = peer.next_log_idx() - 1;
        if last_log_idx >= cur_nxt_idx {
            return Err(RaftError::fatal(format!(
                "peer's last log index is too large {last_log_idx} v.s. {cur_nxt_idx}"
            )));
        }

        // the peer needs entries that only a snapshot still holds
        if last_log_idx + 1 < start_idx {
            return self.create_sync_snapshot_req(peer, last_log_idx, term, commit_idx);
        }

        let last_log_term = self.term_for_log(last_log_idx)?;
        let end_idx = cur_nxt_idx.min(last_log_idx + 1 + self.ctx.params.max_append_size);
        let entries = self.log_store.entries(last_log_idx + 1, end_idx)?;
        debug!(
            id = self.id,
            peer = peer.id(),
            last_log_idx,
            last_log_term,
            entries = entries.len(),
            commit_idx,
            "append entries request"
        );
        Ok(ReqMsg::new(
            term,
            MsgType::AppendEntriesRequest,
            self.id,
            peer.id(),
            last_log_term,
            last_log_idx,
            commit_idx,
        )
        .with_entries(entries))
    }

    pub(super) fn handle_hb_timeout(&self, peer_id: ServerId) {
        if self.is_stopped() {
            return;
        }
        let outcome = self.with_core(|core| {
            debug!(id = self.id, peer = peer_id, "heartbeat timeout");
            if core.role != SrvRole::Leader {
                info!(id = self.id, peer = peer_id, "not a leader anymore, skip heartbeat");
                return Ok(());
            }
            self.request_append_entries_for(core, peer_id)?;
            if let Some(peer) = core.peers.get(&peer_id) {
                if peer.is_hb_enabled() {
                    peer.schedule_next_hb();
                } else {
                    debug!(id = self.id, peer = peer_id, "heartbeat is disabled");
                }
            }
            Ok(())
        });
        let _ = self.supervise(outcome);
    }

    /// Responses to vote, AppendEntries and InstallSnapshot requests
    pub(super) fn handle_peer_resp(&self, core: &mut ServerCore, result: Result<RespMsg, RpcError>) -> Result<(), RaftError> {
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                info!(id = self.id, %err, "peer response error");
                return Ok(());
            }
        };
        debug!(
            id = self.id,
            msg_type = ?resp.msg_type(),
            src = resp.src(),
            accepted = resp.accepted(),
            term = resp.term(),
            next_idx = resp.next_idx(),
            "receive a response"
        );

        if self.update_term(core, resp.term())? {
            return Ok(());
        }
        if resp.term() < core.state.term() {
            debug!(id = self.id, src = resp.src(), "ignore a response from a lower term");
            return Ok(());
        }

        match resp.msg_type() {
            MsgType::RequestVoteResponse => self.handle_voting_resp(core, &resp),
            MsgType::AppendEntriesResponse => self.handle_append_entries_resp(core, &resp),
            MsgType::InstallSnapshotResponse => self.handle_install_snapshot_resp(core, &resp),
            other => Err(RaftError::fatal(format!(
                "received an unexpected message {other:?} for response"
            ))),
        }
    }

    fn handle_append_entries_resp(&self, core: &mut ServerCore, resp: &RespMsg) -> Result<(), RaftError> {
        if core.role != SrvRole::Leader {
            return Ok(());
        }
        let Some(peer) = core.peers.get_mut(&resp.src()) else {
            info!(id = self.id, peer = resp.src(), "the response is from an unknown peer");
            return Ok(());
        };

        let mut need_to_catchup = true;
        if resp.accepted() {
            peer.set_next_log_idx(resp.next_idx());
            peer.set_matched_idx(resp.next_idx().saturating_sub(1));

            // majority-matched index: sort descending, the leader counts itself
            let mut matched: Vec<u64> = core.peers.values().map(Peer::matched_idx).collect();
            matched.push(self.last_log_idx());
            matched.sort_unstable_by(|a, b| b.cmp(a));
            let majority_idx = matched[core.cluster_size() / 2];
            self.commit(core, majority_idx)?;

            if let Some(peer) = core.peers.get(&resp.src()) {
                need_to_catchup = peer.clear_pending_commit() || resp.next_idx() < self.log_store.next_slot();
            }
        } else if peer.next_log_idx() > 1 {
            peer.set_next_log_idx(peer.next_log_idx() - 1);
        }

        if core.role == SrvRole::Leader && need_to_catchup {
            self.request_append_entries_for(core, resp.src())?;
        }
        Ok(())
    }
}
