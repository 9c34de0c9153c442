//! # raft-core
//!
//! why: implement the raft consensus algorithm as an embeddable library
//! relations: raft-storage supplies the file backed log store and state
//!            manager; applications supply the state machine and rpc transport
//! what: server, wire messages, log store contract, timers, async results
//!
//! The server never touches the network or the disk directly. Everything it
//! needs comes through the traits collected in a [`Context`].

pub mod async_result;
pub mod buffer;
pub mod cluster_config;
pub mod context;
pub mod error;
pub mod log;
pub mod log_entry;
pub mod message;
pub mod params;
pub mod peer;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod snapshot;
pub mod srv_state;
pub mod state_machine;
pub mod state_mgr;

pub use async_result::AsyncResult;
pub use buffer::Buffer;
pub use cluster_config::{ClusterConfig, ServerId, SrvConfig};
pub use context::Context;
pub use error::{BufferError, LogStoreError, RaftError, RpcError, SnapshotError};
pub use log::{InMemLogStore, LogStore};
pub use log_entry::{LogEntry, LogValType};
pub use message::{MsgType, ReqMsg, RespMsg};
pub use params::RaftParams;
pub use rpc::{MsgHandler, RpcClient, RpcClientFactory, RpcListener, RpcResult};
pub use scheduler::{DelayedTask, DelayedTaskScheduler, TokioScheduler};
pub use server::{RaftServer, SrvRole};
pub use snapshot::{Snapshot, SnapshotSyncReq};
pub use srv_state::SrvState;
pub use state_machine::{SnapshotHandler, StateMachine};
pub use state_mgr::{InMemoryStateManager, StateManager};
