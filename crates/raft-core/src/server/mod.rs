//! # server
//!
//! why: the raft protocol itself; roles, terms, votes, replication, membership
//! relations: built from a Context, driven by MsgHandler::process_req, timer
//!            callbacks from the scheduler and rpc completions from peers
//! what: RaftServer and its lock-protected core state
//!
//! All consensus state sits behind one non-reentrant mutex. Requests produced
//! while it is held are queued and only sent once it is released, so rpc
//! completions (which may run inline) can take the lock again.

mod commit;
mod election;
mod membership;
mod replication;
mod snapshot_sync;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster_config::{ClusterConfig, ServerId, SrvConfig};
use crate::context::Context;
use crate::error::{RaftError, RpcError};
use crate::log::LogStore;
use crate::log_entry::{LogEntry, LogValType};
use crate::message::{MsgType, ReqMsg, RespMsg};
use crate::peer::{Outgoing, Peer, Route};
use crate::rpc::MsgHandler;
use crate::scheduler::DelayedTask;
use crate::srv_state::SrvState;

use self::commit::CommitSignal;

/// The three roles a raft server moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SrvRole {
    /// Passive, answers the leader and votes
    #[default]
    Follower,
    /// Asking for votes after an election timeout
    Candidate,
    /// Replicates the log and drives commits
    Leader,
}

/// Mutable consensus state, only touched with the server lock held.
struct ServerCore {
    role: SrvRole,
    state: SrvState,
    leader: Option<ServerId>,
    config: Arc<ClusterConfig>,
    peers: BTreeMap<ServerId, Peer>,
    votes_granted: usize,
    votes_responded: usize,
    election_completed: bool,
    /// A configuration entry is appended but not yet committed
    config_changing: bool,
    /// Joining a cluster, receiving log but not yet a voting member
    catching_up: bool,
    /// Election timeouts left before a removed server shuts down; 0 = off
    steps_to_down: u32,
    /// Highest index known to be committed, may run ahead of what is applied
    quick_commit_idx: u64,
    srv_to_join: Option<Peer>,
    conf_to_add: Option<SrvConfig>,
    outbox: Vec<Outgoing>,
    pending_exit: Option<i32>,
}

impl ServerCore {
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// The joining server takes precedence since it is never in `peers`.
    fn peer_mut(&mut self, id: ServerId) -> Option<&mut Peer> {
        match self.srv_to_join.as_mut() {
            Some(join) if join.id() == id => Some(join),
            _ => self.peers.get_mut(&id),
        }
    }
}

/// A raft server. Create it with [`RaftServer::new`], hand it to an
/// `RpcListener` as its `MsgHandler`, and call [`RaftServer::shutdown`] when done.
pub struct RaftServer {
    id: ServerId,
    ctx: Context,
    log_store: Arc<dyn LogStore>,
    core: Mutex<ServerCore>,
    election_task: Arc<DelayedTask>,
    commit_signal: Arc<CommitSignal>,
    commit_worker: Mutex<Option<JoinHandle<()>>>,
    snp_in_progress: Arc<AtomicBool>,
    stopped: AtomicBool,
    weak_self: Weak<RaftServer>,
}

impl RaftServer {
    /// Restore state from the state manager, start the commit worker and arm
    /// the election timer.
    pub fn new(ctx: Context) -> Result<Arc<Self>, RaftError> {
        let id = ctx.state_mgr.server_id();
        let log_store = ctx.state_mgr.load_log_store()?;
        let state = ctx.state_mgr.read_state()?.unwrap_or_default();
        let mut config = ctx.state_mgr.load_config()?;

        // configurations appended after the last commit are already in effect
        let from = (state.commit_idx() + 1).max(log_store.start_index());
        for idx in from..log_store.next_slot() {
            if let Some(entry) = log_store.entry_at(idx)? {
                if entry.value_type() == LogValType::Conf {
                    info!(id, idx, "found an uncommitted configuration in the log");
                    config = Arc::new(ClusterConfig::from_bytes(entry.payload())?);
                }
            }
        }

        let commit_signal = Arc::new(CommitSignal::new(state.commit_idx()));
        let server = Arc::new_cyclic(|weak: &Weak<RaftServer>| {
            let timeout = weak.clone();
            let election_task = DelayedTask::new(move || {
                if let Some(server) = timeout.upgrade() {
                    server.handle_election_timeout();
                }
            });

            let mut peers = BTreeMap::new();
            for srv in config.servers() {
                if srv.id() != id {
                    peers.insert(srv.id(), Self::create_peer(&ctx, weak, srv.clone()));
                }
            }

            RaftServer {
                id,
                log_store,
                core: Mutex::new(ServerCore {
                    role: SrvRole::Follower,
                    state,
                    leader: None,
                    config,
                    peers,
                    votes_granted: 0,
                    votes_responded: 0,
                    election_completed: false,
                    config_changing: false,
                    catching_up: false,
                    steps_to_down: 0,
                    quick_commit_idx: state.commit_idx(),
                    srv_to_join: None,
                    conf_to_add: None,
                    outbox: Vec::new(),
                    pending_exit: None,
                }),
                election_task,
                commit_signal,
                commit_worker: Mutex::new(None),
                snp_in_progress: Arc::new(AtomicBool::new(false)),
                stopped: AtomicBool::new(false),
                weak_self: weak.clone(),
                ctx,
            }
        });

        server.start_commit_worker()?;
        {
            let core = server.core.lock();
            server.restart_election_timer(&core);
        }
        info!(
            id,
            term = state.term(),
            commit_idx = state.commit_idx(),
            "raft server started"
        );
        Ok(server)
    }

    fn create_peer(ctx: &Context, weak: &Weak<RaftServer>, srv: SrvConfig) -> Peer {
        let hb = weak.clone();
        let peer_id = srv.id();
        let rpc = ctx.rpc_cli_factory.create_client(srv.endpoint());
        Peer::new(srv, rpc, Arc::clone(&ctx.scheduler), &ctx.params, move || {
            if let Some(server) = hb.upgrade() {
                server.handle_hb_timeout(peer_id);
            }
        })
    }

    fn new_peer(&self, srv: SrvConfig) -> Peer {
        Self::create_peer(&self.ctx, &self.weak_self, srv)
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn role(&self) -> SrvRole {
        self.core.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == SrvRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.core.lock().state.term()
    }

    /// Known leader, if any
    pub fn leader(&self) -> Option<ServerId> {
        self.core.lock().leader
    }

    /// Durable commit index, i.e. what the state machine has applied
    pub fn commit_idx(&self) -> u64 {
        self.core.lock().state.commit_idx()
    }

    pub fn quick_commit_idx(&self) -> u64 {
        self.core.lock().quick_commit_idx
    }

    pub fn config(&self) -> Arc<ClusterConfig> {
        Arc::clone(&self.core.lock().config)
    }

    pub fn is_catching_up(&self) -> bool {
        self.core.lock().catching_up
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn log_store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.log_store)
    }

    /// Stop timers and the commit worker. Idempotent.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop_timers();
        }
        self.commit_signal.stop();
        if let Some(worker) = self.commit_worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        info!(id = self.id, "raft server shut down");
    }

    // -- lock discipline --

    /// Run `f` under the server lock, then send whatever it queued and honor
    /// a requested exit.
    fn with_core<R>(
        &self,
        f: impl FnOnce(&mut ServerCore) -> Result<R, RaftError>,
    ) -> Result<R, RaftError> {
        let (result, mut outbox, exit) = {
            let mut core = self.core.lock();
            let result = f(&mut *core);
            (result, std::mem::take(&mut core.outbox), core.pending_exit.take())
        };
        if matches!(&result, Err(err) if err.is_fatal()) {
            outbox.clear();
        }
        self.dispatch(outbox);
        if let Some(exit_code) = exit {
            self.terminate(exit_code);
        }
        result
    }

    fn dispatch(&self, outbox: Vec<Outgoing>) {
        for Outgoing { client, req, route } in outbox {
            let weak = self.weak_self.clone();
            let sent = req.clone();
            client.send(req).when_ready(move |result| {
                if let Some(server) = weak.upgrade() {
                    server.on_rpc_result(route, sent, result);
                }
            });
        }
    }

    fn on_rpc_result(&self, route: Route, req: ReqMsg, result: Result<RespMsg, RpcError>) {
        if self.is_stopped() {
            return;
        }
        let outcome = self.with_core(|core| {
            if let Some(peer) = core.peer_mut(req.dst()) {
                peer.handle_rpc_result(req.msg_type(), result.is_ok());
            }
            match route {
                Route::Replication => self.handle_peer_resp(core, result),
                Route::Extended => self.handle_ext_resp(core, req, result),
            }
        });
        let _ = self.supervise(outcome);
    }

    /// Top-level error policy: fatal errors terminate the server with -1.
    fn supervise<T>(&self, result: Result<T, RaftError>) -> Result<T, RaftError> {
        match &result {
            Err(err) if err.is_fatal() => {
                error!(id = self.id, %err, "unrecoverable error, terminating");
                self.terminate(-1);
            }
            Err(RaftError::ShutDown) => debug!(id = self.id, "server is shut down"),
            Err(err) => warn!(id = self.id, %err, "failed to handle event"),
            Ok(_) => {}
        }
        result
    }

    fn terminate(&self, exit_code: i32) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_timers();
        self.commit_signal.stop();
        self.ctx.state_mgr.system_exit(exit_code);
    }

    fn stop_timers(&self) {
        self.ctx.scheduler.cancel(&self.election_task);
        let mut core = self.core.lock();
        for peer in core.peers.values_mut() {
            peer.enable_hb(false);
        }
        if let Some(join) = core.srv_to_join.as_mut() {
            join.enable_hb(false);
        }
    }

    // -- timers and role transitions --

    fn restart_election_timer(&self, core: &ServerCore) {
        if core.catching_up || self.is_stopped() {
            return;
        }
        let lower = self.ctx.params.election_timeout_lower_bound;
        let upper = self.ctx.params.election_timeout_upper_bound.max(lower);
        let timeout = rand::thread_rng().gen_range(lower..=upper);
        self.ctx.scheduler.schedule(&self.election_task, timeout);
    }

    fn stop_election_timer(&self) {
        self.ctx.scheduler.cancel(&self.election_task);
    }

    /// Move to a newer term. Returns true if the term changed.
    fn update_term(&self, core: &mut ServerCore, term: u64) -> Result<bool, RaftError> {
        if term <= core.state.term() {
            return Ok(false);
        }
        core.state.set_term(term);
        core.leader = None;
        core.votes_granted = 0;
        core.votes_responded = 0;
        core.election_completed = false;
        self.ctx.state_mgr.save_state(&core.state)?;
        self.become_follower(core);
        Ok(true)
    }

    fn become_follower(&self, core: &mut ServerCore) {
        for peer in core.peers.values_mut() {
            peer.enable_hb(false);
        }
        if let Some(mut join) = core.srv_to_join.take() {
            join.enable_hb(false);
        }
        core.conf_to_add = None;
        core.role = SrvRole::Follower;
        self.restart_election_timer(core);
    }

    fn become_leader(&self, core: &mut ServerCore) -> Result<(), RaftError> {
        self.stop_election_timer();
        core.role = SrvRole::Leader;
        core.leader = Some(self.id);
        core.srv_to_join = None;
        core.conf_to_add = None;

        let next = self.log_store.next_slot();
        for peer in core.peers.values_mut() {
            peer.set_next_log_idx(next);
            peer.set_matched_idx(0);
            peer.set_snapshot_in_sync(None);
            peer.set_free();
            peer.start_heartbeat();
        }

        if core.config.log_idx() == 0 {
            // anchor the bootstrap configuration in the log
            let mut conf = (*core.config).clone();
            conf.set_log_idx(next);
            let entry = LogEntry::new(
                core.state.term(),
                conf.serialize()?.into_vec(),
                LogValType::Conf,
            );
            self.log_store.append(&entry)?;
            info!(id = self.id, idx = next, "save initial config to log store");
            core.config = Arc::new(conf);
            core.config_changing = true;
        } else {
            core.config_changing = core.config.log_idx() > core.quick_commit_idx;
        }

        info!(id = self.id, term = core.state.term(), "server becomes leader");
        self.request_append_entries(core)
    }

    // -- configuration --

    /// Make `new_config` the active configuration, adding and removing peers.
    fn reconfigure(&self, core: &mut ServerCore, new_config: Arc<ClusterConfig>) -> Result<(), RaftError> {
        debug!(
            id = self.id,
            log_idx = new_config.log_idx(),
            prev_log_idx = new_config.prev_log_idx(),
            "system is reconfigured"
        );

        let added: Vec<SrvConfig> = new_config
            .servers()
            .iter()
            .filter(|srv| srv.id() != self.id && !core.peers.contains_key(&srv.id()))
            .cloned()
            .collect();
        let removed: Vec<ServerId> = core
            .peers
            .keys()
            .copied()
            .filter(|id| !new_config.contains(*id))
            .collect();
        let self_removed =
            !core.catching_up && core.config.contains(self.id) && !new_config.contains(self.id);

        for srv in added {
            let srv_id = srv.id();
            let mut peer = match core.srv_to_join.take() {
                Some(join) if join.id() == srv_id => join,
                other => {
                    core.srv_to_join = other;
                    let mut peer = self.new_peer(srv);
                    peer.set_next_log_idx(self.log_store.next_slot());
                    peer
                }
            };
            if core.role == SrvRole::Leader {
                peer.start_heartbeat();
            }
            info!(id = self.id, peer = srv_id, "server is added to cluster");
            core.peers.insert(srv_id, peer);
        }

        for srv_id in removed {
            if let Some(mut peer) = core.peers.remove(&srv_id) {
                peer.enable_hb(false);
                info!(id = self.id, peer = srv_id, "server is removed from cluster");
            }
        }

        if self_removed {
            info!(
                id = self.id,
                "this server is removed from cluster, stepping down after two election timeouts"
            );
            self.ctx.state_mgr.save_config(&new_config)?;
            core.steps_to_down = 2;
        }

        core.config = new_config;
        Ok(())
    }

    // -- log helpers --

    /// Term of `idx` if this server still knows it.
    fn log_term_if_known(&self, idx: u64) -> Option<u64> {
        if idx == 0 {
            return Some(0);
        }
        if idx >= self.log_store.start_index() {
            if idx >= self.log_store.next_slot() {
                return None;
            }
            return Some(self.log_store.term_at(idx));
        }
        self.ctx
            .state_machine
            .last_snapshot()
            .filter(|snp| snp.last_log_idx() == idx)
            .map(|snp| snp.last_log_term())
    }

    /// Term of `idx`, which must be retained or be the last snapshot's index.
    fn term_for_log(&self, idx: u64) -> Result<u64, RaftError> {
        self.log_term_if_known(idx).ok_or_else(|| {
            RaftError::fatal(format!(
                "bad log_idx {idx} for retrieving the term value, start index is {}",
                self.log_store.start_index()
            ))
        })
    }

    fn last_log_idx(&self) -> u64 {
        self.log_store.next_slot() - 1
    }

    fn last_log_term(&self) -> u64 {
        self.log_term_if_known(self.last_log_idx()).unwrap_or(0)
    }
}

impl MsgHandler for RaftServer {
    fn process_req(&self, req: ReqMsg) -> Result<RespMsg, RaftError> {
        if self.is_stopped() {
            return Err(RaftError::ShutDown);
        }
        debug!(
            id = self.id,
            msg_type = ?req.msg_type(),
            src = req.src(),
            term = req.term(),
            last_log_idx = req.last_log_idx(),
            last_log_term = req.last_log_term(),
            commit_idx = req.commit_idx(),
            "receive a request"
        );

        let result = self.with_core(|core| {
            if matches!(
                req.msg_type(),
                MsgType::AppendEntriesRequest
                    | MsgType::RequestVoteRequest
                    | MsgType::InstallSnapshotRequest
            ) {
                self.update_term(core, req.term())?;
                // still hearing from the cluster, restart the countdown
                if core.steps_to_down > 0 {
                    core.steps_to_down = 2;
                }
            }

            match req.msg_type() {
                MsgType::AppendEntriesRequest => self.handle_append_entries(core, &req),
                MsgType::RequestVoteRequest => self.handle_vote_req(core, &req),
                MsgType::ClientRequest => self.handle_cli_req(core, &req),
                _ => self.handle_extended_msg(core, &req),
            }
        });

        let result = self.supervise(result);
        if let Ok(resp) = &result {
            debug!(
                id = self.id,
                msg_type = ?resp.msg_type(),
                accepted = resp.accepted(),
                term = resp.term(),
                next_idx = resp.next_idx(),
                "response back"
            );
        }
        result
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.commit_signal.stop();
        self.ctx.scheduler.cancel(&self.election_task);
    }
}

impl fmt::Debug for RaftServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("RaftServer")
            .field("id", &self.id)
            .field("role", &core.role)
            .field("term", &core.state.term())
            .field("commit_idx", &core.state.commit_idx())
            .field("leader", &core.leader)
            .finish()
    }
}
