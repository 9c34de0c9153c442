//! Election timeout, vote requests and vote counting.

use tracing::{debug, info};

use super::{RaftServer, ServerCore, SrvRole};
use crate::error::RaftError;
use crate::message::{MsgType, ReqMsg, RespMsg};
use crate::peer::Route;

impl RaftServer {
    pub(super) fn handle_election_timeout(&self) {
        if self.is_stopped() {
            return;
        }
        let outcome = self.with_core(|core| {
            if core.steps_to_down > 0 {
                core.steps_to_down -= 1;
                if core.steps_to_down == 0 {
                    info!(
                        id = self.id,
                        "no further news from the leader, leaving the cluster"
                    );
                    core.pending_exit = Some(0);
                    return Ok(());
                }
                info!(
                    id = self.id,
                    steps_left = core.steps_to_down,
                    "stepping down, skip this election timeout event"
                );
                self.restart_election_timer(core);
                return Ok(());
            }

            if core.catching_up {
                info!(id = self.id, "catching up with the leader, skip election");
                return Ok(());
            }

            if !core.config.contains(self.id) {
                info!(id = self.id, "not a member of the configuration, skip election");
                self.restart_election_timer(core);
                return Ok(());
            }

            if core.role == SrvRole::Leader {
                // fired just before the timer was cancelled by winning the election
                if self.election_task.is_cancelled() {
                    debug!(id = self.id, "stale election timeout, already leader");
                    return Ok(());
                }
                return Err(RaftError::fatal("a leader should never encounter an election timeout"));
            }

            debug!(id = self.id, term = core.state.term(), "election timeout, change to candidate");
            core.state.inc_term();
            core.state.set_voted_for(None);
            core.role = SrvRole::Candidate;
            core.votes_granted = 0;
            core.votes_responded = 0;
            core.election_completed = false;
            core.leader = None;
            self.ctx.state_mgr.save_state(&core.state)?;
            self.request_vote(core)?;

            if core.role != SrvRole::Leader {
                self.restart_election_timer(core);
            }
            Ok(())
        });
        let _ = self.supervise(outcome);
    }

    fn request_vote(&self, core: &mut ServerCore) -> Result<(), RaftError> {
        core.state.set_voted_for(Some(self.id));
        self.ctx.state_mgr.save_state(&core.state)?;
        core.votes_granted += 1;
        core.votes_responded += 1;
        info!(id = self.id, term = core.state.term(), "requesting votes");

        if core.votes_granted > core.cluster_size() / 2 {
            info!(id = self.id, term = core.state.term(), "server is elected as leader");
            core.election_completed = true;
            return self.become_leader(core);
        }

        let term = core.state.term();
        let last_log_idx = self.last_log_idx();
        let last_log_term = self.last_log_term();
        for peer in core.peers.values() {
            let req = ReqMsg::new(
                term,
                MsgType::RequestVoteRequest,
                self.id,
                peer.id(),
                last_log_term,
                last_log_idx,
                core.quick_commit_idx,
            );
            debug!(id = self.id, peer = peer.id(), "send vote request");
            core.outbox.push(peer.send_req(req, Route::Replication));
        }
        Ok(())
    }

    pub(super) fn handle_vote_req(&self, core: &mut ServerCore, req: &ReqMsg) -> Result<RespMsg, RaftError> {
        let mut resp = RespMsg::new(
            core.state.term(),
            MsgType::RequestVoteResponse,
            self.id,
            req.src(),
        );

        let last_log_term = self.last_log_term();
        let log_okay = req.last_log_term() > last_log_term
            || (req.last_log_term() == last_log_term && req.last_log_idx() >= self.last_log_idx());
        let vote_free = match core.state.voted_for() {
            None => true,
            Some(voted) => voted == req.src(),
        };
        let grant = req.term() == core.state.term() && log_okay && vote_free;

        if grant {
            core.state.set_voted_for(Some(req.src()));
            self.ctx.state_mgr.save_state(&core.state)?;
            resp.accept(self.log_store.next_slot());
            self.restart_election_timer(core);
        }
        debug!(
            id = self.id,
            candidate = req.src(),
            term = req.term(),
            granted = grant,
            "vote request handled"
        );
        Ok(resp)
    }

    pub(super) fn handle_voting_resp(&self, core: &mut ServerCore, resp: &RespMsg) -> Result<(), RaftError> {
        if core.election_completed || core.role != SrvRole::Candidate {
            info!(id = self.id, peer = resp.src(), "election completed, ignore the voting result");
            return Ok(());
        }

        core.votes_responded += 1;
        if resp.accepted() {
            core.votes_granted += 1;
        }
        if core.votes_responded >= core.cluster_size() {
            core.election_completed = true;
        }
        if core.votes_granted > core.cluster_size() / 2 {
            info!(
                id = self.id,
                term = core.state.term(),
                votes = core.votes_granted,
                "server is elected as leader"
            );
            core.election_completed = true;
            self.become_leader(core)?;
        }
        Ok(())
    }
}
