//! # context
//!
//! why: bundle the collaborators a raft server is built from
//! relations: consumed by RaftServer::new
//! what: Context

use std::sync::Arc;

use crate::params::RaftParams;
use crate::rpc::RpcClientFactory;
use crate::scheduler::DelayedTaskScheduler;
use crate::state_machine::StateMachine;
use crate::state_mgr::StateManager;

/// Everything a raft server needs from its host
#[derive(Clone)]
pub struct Context {
    pub state_mgr: Arc<dyn StateManager>,
    pub state_machine: Arc<dyn StateMachine>,
    pub rpc_cli_factory: Arc<dyn RpcClientFactory>,
    pub scheduler: Arc<dyn DelayedTaskScheduler>,
    pub params: RaftParams,
}

impl Context {
    pub fn new(
        state_mgr: Arc<dyn StateManager>,
        state_machine: Arc<dyn StateMachine>,
        rpc_cli_factory: Arc<dyn RpcClientFactory>,
        scheduler: Arc<dyn DelayedTaskScheduler>,
        params: RaftParams,
    ) -> Self {
        Self {
            state_mgr,
            state_machine,
            rpc_cli_factory,
            scheduler,
            params,
        }
    }
}
