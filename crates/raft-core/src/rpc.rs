//! # rpc
//!
//! why: the consensus core is transport agnostic
//! relations: the raft server implements MsgHandler and sends through RpcClient
//! what: RpcClient, RpcClientFactory, RpcListener, MsgHandler traits

use std::sync::Arc;

use crate::async_result::AsyncResult;
use crate::error::{RaftError, RpcError};
use crate::message::{ReqMsg, RespMsg};

/// Pending outcome of one request
pub type RpcResult = AsyncResult<RespMsg, RpcError>;

/// Sends requests to one remote server.
pub trait RpcClient: Send + Sync {
    fn send(&self, req: ReqMsg) -> Arc<RpcResult>;
}

pub trait RpcClientFactory: Send + Sync {
    fn create_client(&self, endpoint: &str) -> Arc<dyn RpcClient>;
}

/// Inbound side of the transport.
pub trait MsgHandler: Send + Sync {
    fn process_req(&self, req: ReqMsg) -> Result<RespMsg, RaftError>;
}

/// Accepts connections and feeds requests to a [`MsgHandler`].
pub trait RpcListener: Send + Sync {
    fn listen(&self, handler: Arc<dyn MsgHandler>);
    fn stop(&self);
}
