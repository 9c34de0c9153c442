//! # srv_state
//!
//! why: term, vote and commit index must survive restarts for raft to stay safe
//! relations: owned by the raft server, persisted through the StateManager
//! what: SrvState record

use serde::{Deserialize, Serialize};

use crate::cluster_config::ServerId;

/// Durable per-server consensus state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SrvState {
    term: u64,
    voted_for: Option<ServerId>,
    commit_idx: u64,
}

impl SrvState {
    pub fn new(term: u64, voted_for: Option<ServerId>, commit_idx: u64) -> Self {
        Self {
            term,
            voted_for,
            commit_idx,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Advance the term; the vote is cleared whenever the term moves forward.
    pub fn set_term(&mut self, term: u64) {
        if term > self.term {
            self.voted_for = None;
        }
        self.term = term;
    }

    pub fn inc_term(&mut self) {
        self.set_term(self.term + 1);
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    pub fn set_voted_for(&mut self, voted_for: Option<ServerId>) {
        self.voted_for = voted_for;
    }

    pub fn commit_idx(&self) -> u64 {
        self.commit_idx
    }

    /// Commit index only moves forward.
    pub fn set_commit_idx(&mut self, commit_idx: u64) {
        if commit_idx > self.commit_idx {
            self.commit_idx = commit_idx;
        }
    }

    /// Adopt another server's view, used when joining a cluster. The commit
    /// index is taken as is, the term never goes backwards.
    pub(crate) fn reset_to(&mut self, term: u64, commit_idx: u64) {
        self.set_term(self.term.max(term));
        self.commit_idx = commit_idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_term_clears_vote() {
        let mut state = SrvState::new(3, Some(2), 0);
        state.set_term(3);
        assert_eq!(state.voted_for(), Some(2));
        state.inc_term();
        assert_eq!(state.term(), 4);
        assert_eq!(state.voted_for(), None);
    }

    #[test]
    fn commit_idx_never_moves_back() {
        let mut state = SrvState::default();
        state.set_commit_idx(10);
        state.set_commit_idx(5);
        assert_eq!(state.commit_idx(), 10);
    }

    #[test]
    fn reset_keeps_the_newer_term() {
        let mut state = SrvState::new(7, Some(3), 12);
        state.reset_to(5, 0);
        assert_eq!(state.term(), 7);
        assert_eq!(state.voted_for(), Some(3));
        assert_eq!(state.commit_idx(), 0);

        state.reset_to(8, 0);
        assert_eq!(state.term(), 8);
        assert_eq!(state.voted_for(), None);
    }

    #[test]
    fn json_round_trip() {
        let state = SrvState::new(9, None, 31);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<SrvState>(&json).unwrap(), state);
    }
}
