//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements the LogStore and StateManager traits of raft-core
//! what: FsLogStore (file backed log), FileStateManager (state, config, log)

pub mod fs_log_store;
pub mod state_mgr;

pub use fs_log_store::{FsLogStore, DEFAULT_BUFFER_SIZE};
pub use state_mgr::FileStateManager;
