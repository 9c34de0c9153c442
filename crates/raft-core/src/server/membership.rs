//! Membership changes: adding a server through join and log sync, removing
//! one through leave, and retrying the extended requests that drive them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{RaftServer, ServerCore, SrvRole};
use crate::buffer::Buffer;
use crate::cluster_config::{ClusterConfig, ServerId, SrvConfig};
use crate::error::{RaftError, RpcError};
use crate::log_entry::{LogEntry, LogValType};
use crate::message::{MsgType, ReqMsg, RespMsg};
use crate::peer::Route;
use crate::scheduler::DelayedTask;

impl RaftServer {
    pub(super) fn handle_extended_msg(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        match req.msg_type() {
            MsgType::AddServerRequest => self.handle_add_srv_req(core, req),
            MsgType::RemoveServerRequest => self.handle_rm_srv_req(core, req),
            MsgType::SyncLogRequest => self.handle_log_sync_req(core, req),
            MsgType::JoinClusterRequest => self.handle_join_cluster_req(core, req),
            MsgType::LeaveClusterRequest => self.handle_leave_cluster_req(core, req),
            MsgType::InstallSnapshotRequest => self.handle_install_snapshot_req(core, req),
            other => Err(RaftError::fatal(format!(
                "received an unknown request type {other:?}"
            ))),
        }
    }

    fn leader_hint(core: &ServerCore) -> ServerId {
        core.leader.unwrap_or(-1)
    }

    // -- leader side: add server --

    fn handle_add_srv_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::AddServerResponse,
            self.id,
            Self::leader_hint(core),
        );
        let entries = req.log_entries();
        if entries.len() != 1 || entries[0].value_type() != LogValType::ClusterServer {
            debug!(id = self.id, "bad add server request, expecting one cluster server entry");
            return Ok(resp);
        }
        if core.role != SrvRole::Leader {
            info!(id = self.id, "this is not a leader, cannot handle add server request");
            return Ok(resp);
        }

        let srv = match SrvConfig::from_bytes(entries[0].payload()) {
            Ok(srv) => srv,
            Err(err) => {
                warn!(id = self.id, %err, "malformed server configuration in add server request");
                return Ok(resp);
            }
        };
        if srv.id() == self.id || core.peers.contains_key(&srv.id()) {
            warn!(id = self.id, peer = srv.id(), "the server to be added has a duplicated id");
            return Ok(resp);
        }
        if core.config_changing
            || core.srv_to_join.is_some()
            || core.config.log_idx() == 0
            || core.config.log_idx() > core.quick_commit_idx
        {
            info!(id = self.id, "previous config has not committed yet");
            return Ok(resp);
        }

        info!(id = self.id, peer = srv.id(), endpoint = srv.endpoint(), "adding server");
        core.conf_to_add = Some(srv.clone());
        core.srv_to_join = Some(self.new_peer(srv));
        self.invite_srv_to_join_cluster(core)?;
        resp.accept(self.log_store.next_slot());
        Ok(resp)
    }

    fn invite_srv_to_join_cluster(&self, core: &mut ServerCore) -> Result<(), RaftError> {
        let entry = LogEntry::new(
            core.state.term(),
            core.config.serialize()?.into_vec(),
            LogValType::Conf,
        );
        let Some(join) = core.srv_to_join.as_ref() else {
            return Ok(());
        };
        let req = ReqMsg::new(
            core.state.term(),
            MsgType::JoinClusterRequest,
            self.id,
            join.id(),
            0,
            self.last_log_idx(),
            core.quick_commit_idx,
        )
        .with_entries(vec![entry]);
        info!(id = self.id, peer = join.id(), "invite server to join the cluster");
        core.outbox.push(join.send_req(req, Route::Extended));
        Ok(())
    }

    /// Feed the joining server from `start_idx`, or admit it once close enough.
    fn sync_log_to_new_srv(&self, core: &mut ServerCore, start_idx: u64) -> Result<(), RaftError> {
        let gap = core.quick_commit_idx.saturating_sub(start_idx);
        let term = core.state.term();
        let commit_idx = core.quick_commit_idx;

        if gap < self.ctx.params.log_sync_stop_gap {
            let Some(join) = core.srv_to_join.as_ref() else {
                return Ok(());
            };
            info!(
                id = self.id,
                peer = join.id(),
                gap,
                "log sync is done, now put the server into cluster"
            );
            let joining = core
                .conf_to_add
                .take()
                .unwrap_or_else(|| join.config().clone());

            let mut new_config = ClusterConfig::new(self.log_store.next_slot(), core.config.log_idx());
            for srv in core.config.servers() {
                new_config.add_server(srv.clone());
            }
            new_config.add_server(joining);

            let entry = LogEntry::new(term, new_config.serialize()?.into_vec(), LogValType::Conf);
            self.log_store.append(&entry)?;
            core.config_changing = true;
            self.reconfigure(core, Arc::new(new_config))?;
            return self.request_append_entries(core);
        }

        let start = self.log_store.start_index();
        let Some(join) = core.srv_to_join.as_mut() else {
            return Ok(());
        };
        let req = if start_idx < start {
            self.create_sync_snapshot_req(join, start_idx.saturating_sub(1), term, commit_idx)?
        } else {
            let count = gap.min(self.ctx.params.log_sync_batch_size);
            let pack = self.log_store.pack(start_idx, count)?;
            debug!(id = self.id, peer = join.id(), start_idx, count, "sync log to new server");
            ReqMsg::new(
                term,
                MsgType::SyncLogRequest,
                self.id,
                join.id(),
                0,
                start_idx.saturating_sub(1),
                commit_idx,
            )
            .with_entries(vec![LogEntry::new(term, pack.into_vec(), LogValType::LogPack)])
        };
        let out = join.send_req(req, Route::Extended);
        core.outbox.push(out);
        Ok(())
    }

    // -- leader side: remove server --

    fn handle_rm_srv_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::RemoveServerResponse,
            self.id,
            Self::leader_hint(core),
        );
        let entries = req.log_entries();
        if entries.len() != 1 || entries[0].payload().len() != 4 {
            info!(id = self.id, "bad remove server request, expecting one 4-byte server id");
            return Ok(resp);
        }
        if core.role != SrvRole::Leader {
            info!(id = self.id, "this is not a leader, cannot handle remove server request");
            return Ok(resp);
        }
        if core.config_changing || core.srv_to_join.is_some() {
            info!(id = self.id, "previous config has not committed yet");
            return Ok(resp);
        }

        let srv_id = Buffer::from_vec(entries[0].payload().to_vec()).get_i32()?;
        if srv_id == self.id {
            info!(id = self.id, "cannot request to remove leader");
            return Ok(resp);
        }
        let Some(peer) = core.peers.get(&srv_id) else {
            info!(id = self.id, peer = srv_id, "server does not exist");
            return Ok(resp);
        };

        let leave = ReqMsg::new(
            core.state.term(),
            MsgType::LeaveClusterRequest,
            self.id,
            srv_id,
            0,
            self.last_log_idx(),
            core.quick_commit_idx,
        );
        info!(id = self.id, peer = srv_id, "asking server to leave the cluster");
        core.outbox.push(peer.send_req(leave, Route::Extended));
        core.config_changing = true;
        resp.accept(self.log_store.next_slot());
        Ok(resp)
    }

    fn rm_srv_from_cluster(&self, core: &mut ServerCore, srv_id: ServerId) -> Result<(), RaftError> {
        let mut new_config = ClusterConfig::new(self.log_store.next_slot(), core.config.log_idx());
        for srv in core.config.servers() {
            if srv.id() != srv_id {
                new_config.add_server(srv.clone());
            }
        }

        info!(
            id = self.id,
            peer = srv_id,
            log_idx = new_config.log_idx(),
            "removed a server from configuration and save the configuration to log store"
        );
        let entry = LogEntry::new(
            core.state.term(),
            new_config.serialize()?.into_vec(),
            LogValType::Conf,
        );
        self.log_store.append(&entry)?;
        core.config_changing = true;
        self.reconfigure(core, Arc::new(new_config))?;
        self.request_append_entries(core)
    }

    // -- joining / leaving side --

    fn handle_join_cluster_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let resp = RespMsg::new(
            core.state.term(),
            MsgType::JoinClusterResponse,
            self.id,
            req.src(),
        );
        let entries = req.log_entries();
        if entries.len() != 1 || entries[0].value_type() != LogValType::Conf {
            info!(id = self.id, "receive an invalid join cluster request");
            return Ok(resp);
        }
        if core.catching_up {
            info!(id = self.id, "this server is already in log syncing mode");
            return Ok(resp);
        }
        let config = match ClusterConfig::from_bytes(entries[0].payload()) {
            Ok(config) => config,
            Err(err) => {
                warn!(id = self.id, %err, "malformed configuration in join cluster request");
                return Ok(resp);
            }
        };

        info!(id = self.id, leader = req.src(), "joining the cluster, start catching up");
        core.catching_up = true;
        core.role = SrvRole::Follower;
        core.leader = Some(req.src());
        core.state.reset_to(req.term(), 0);
        core.quick_commit_idx = 0;
        self.ctx.state_mgr.save_state(&core.state)?;
        self.stop_election_timer();
        self.reconfigure(core, Arc::new(config))?;

        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::JoinClusterResponse,
            self.id,
            req.src(),
        );
        resp.accept(core.quick_commit_idx + 1);
        Ok(resp)
    }

    fn handle_log_sync_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::SyncLogResponse,
            self.id,
            req.src(),
        );
        let entries = req.log_entries();
        if entries.len() != 1 || entries[0].value_type() != LogValType::LogPack {
            info!(id = self.id, "receive an invalid log sync request");
            return Ok(resp);
        }
        if !core.catching_up {
            info!(id = self.id, "this server is ready for cluster, ignore the request");
            return Ok(resp);
        }

        let pack = Buffer::from_vec(entries[0].payload().to_vec());
        self.log_store.apply_pack(req.last_log_idx() + 1, &pack)?;
        self.commit(core, self.last_log_idx())?;
        resp.accept(self.log_store.next_slot());
        Ok(resp)
    }

    fn handle_leave_cluster_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::LeaveClusterResponse,
            self.id,
            req.src(),
        );
        if !core.config_changing {
            info!(id = self.id, "asked to leave the cluster, stepping down after two election timeouts");
            core.steps_to_down = 2;
            resp.accept(0);
        }
        Ok(resp)
    }

    // -- extended responses --

    pub(super) fn handle_ext_resp(
        &self,
        core: &mut ServerCore,
        req: ReqMsg,
        result: Result<RespMsg, RpcError>,
    ) -> Result<(), RaftError> {
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => return self.handle_ext_resp_err(core, req, err),
        };
        debug!(
            id = self.id,
            msg_type = ?resp.msg_type(),
            src = resp.src(),
            accepted = resp.accepted(),
            next_idx = resp.next_idx(),
            "receive an extended response"
        );

        match resp.msg_type() {
            MsgType::JoinClusterResponse => {
                let Some(join) = core.srv_to_join.as_mut().filter(|join| join.id() == resp.src()) else {
                    info!(id = self.id, "no server to join, drop the response");
                    return Ok(());
                };
                if resp.accepted() {
                    info!(id = self.id, peer = resp.src(), "new server confirms it will join, start syncing logs to it");
                    join.set_next_log_idx(resp.next_idx());
                    self.sync_log_to_new_srv(core, resp.next_idx())
                } else {
                    info!(id = self.id, peer = resp.src(), "new server cannot accept the invitation, give up");
                    core.srv_to_join = None;
                    core.conf_to_add = None;
                    Ok(())
                }
            }
            MsgType::SyncLogResponse => {
                let Some(join) = core.srv_to_join.as_mut().filter(|join| join.id() == resp.src()) else {
                    info!(id = self.id, "no server to join, drop the response");
                    return Ok(());
                };
                if !resp.accepted() {
                    info!(id = self.id, peer = resp.src(), "new server declined the log sync");
                    return Ok(());
                }
                join.set_next_log_idx(resp.next_idx());
                join.set_matched_idx(resp.next_idx().saturating_sub(1));
                self.sync_log_to_new_srv(core, resp.next_idx())
            }
            MsgType::InstallSnapshotResponse => {
                let Some(join) = core.srv_to_join.as_mut().filter(|join| join.id() == resp.src()) else {
                    info!(id = self.id, "no server to join, drop the response");
                    return Ok(());
                };
                if resp.accepted() {
                    let progress = join
                        .snapshot_sync_ctx()
                        .map(|ctx| (ctx.snapshot().size(), ctx.snapshot().last_log_idx()));
                    match progress {
                        Some((size, last_idx)) if resp.next_idx() >= size => {
                            debug!(id = self.id, peer = resp.src(), "snapshot sync to new server is done");
                            join.set_snapshot_in_sync(None);
                            join.set_next_log_idx(last_idx + 1);
                            join.set_matched_idx(last_idx);
                        }
                        Some(_) => {
                            if let Some(ctx) = join.snapshot_sync_ctx_mut() {
                                ctx.set_offset(resp.next_idx());
                            }
                        }
                        None => {}
                    }
                }
                let next = join.next_log_idx();
                self.sync_log_to_new_srv(core, next)
            }
            MsgType::LeaveClusterResponse => {
                if !resp.accepted() {
                    info!(id = self.id, peer = resp.src(), "peer doesn't accept to step down, stop proceeding");
                    core.config_changing = false;
                    return Ok(());
                }
                debug!(id = self.id, peer = resp.src(), "peer accepted to step down, removing it");
                self.rm_srv_from_cluster(core, resp.src())
            }
            other => Err(RaftError::fatal(format!(
                "received an unexpected response message type {other:?}"
            ))),
        }
    }

    fn handle_ext_resp_err(&self, core: &mut ServerCore, req: ReqMsg, err: RpcError) -> Result<(), RaftError> {
        debug!(id = self.id, %err, msg_type = ?req.msg_type(), "extended request failed");
        let is_leave = match req.msg_type() {
            MsgType::LeaveClusterRequest => true,
            MsgType::SyncLogRequest | MsgType::JoinClusterRequest | MsgType::InstallSnapshotRequest => false,
            _ => return Ok(()),
        };

        let peer = if is_leave {
            core.peers.get(&req.dst())
        } else {
            core.srv_to_join.as_ref().filter(|join| join.id() == req.dst())
        };
        let Some(peer) = peer else {
            return Ok(());
        };

        if peer.current_hb_interval() >= peer.max_hb_interval() {
            if is_leave {
                info!(
                    id = self.id,
                    peer = req.dst(),
                    "rpc failed again for the removing server, will remove this server directly"
                );
                return self.rm_srv_from_cluster(core, req.dst());
            }
            info!(
                id = self.id,
                peer = req.dst(),
                "rpc failed again for the new coming server, will stop retrying"
            );
            core.config_changing = false;
            core.srv_to_join = None;
            core.conf_to_add = None;
            return Ok(());
        }

        let delay = peer.current_hb_interval();
        debug!(id = self.id, peer = req.dst(), delay, "retry the request");
        let weak = self.weak_self.clone();
        let retry = DelayedTask::new(move || {
            if let Some(server) = weak.upgrade() {
                server.retry_ext_req(req.clone());
            }
        });
        self.ctx.scheduler.schedule(&retry, delay);
        Ok(())
    }

    fn retry_ext_req(&self, req: ReqMsg) {
        if self.is_stopped() {
            return;
        }
        let outcome = self.with_core(|core| {
            if core.role != SrvRole::Leader {
                return Ok(());
            }
            if let Some(peer) = core.peer_mut(req.dst()) {
                let out = peer.send_req(req, Route::Extended);
                core.outbox.push(out);
            }
            Ok(())
        });
        let _ = self.supervise(outcome);
    }
}
