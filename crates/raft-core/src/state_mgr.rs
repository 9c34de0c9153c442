//! # state_mgr
//!
//! why: term, vote, configuration and the log must be durable and owned by the host
//! relations: consulted by the raft server at start-up and after every safety-relevant change
//! what: StateManager trait plus the volatile InMemoryStateManager

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::cluster_config::{ClusterConfig, ServerId};
use crate::log::{InMemLogStore, LogStore};
use crate::srv_state::SrvState;

/// Durable storage for everything a server must remember across restarts.
pub trait StateManager: Send + Sync {
    fn load_config(&self) -> io::Result<Arc<ClusterConfig>>;
    fn save_config(&self, config: &ClusterConfig) -> io::Result<()>;
    fn save_state(&self, state: &SrvState) -> io::Result<()>;
    /// `None` on first start
    fn read_state(&self) -> io::Result<Option<SrvState>>;
    fn load_log_store(&self) -> io::Result<Arc<dyn LogStore>>;
    fn server_id(&self) -> ServerId;
    /// The server cannot continue; `0` after a clean step-down, `-1` on fatal errors.
    fn system_exit(&self, exit_code: i32);
}

/// Keeps everything in memory; `system_exit` only records the code.
pub struct InMemoryStateManager {
    id: ServerId,
    config: Mutex<Arc<ClusterConfig>>,
    state: Mutex<Option<SrvState>>,
    log_store: Arc<dyn LogStore>,
    exit_code: Mutex<Option<i32>>,
}

impl InMemoryStateManager {
    pub fn new(id: ServerId, config: ClusterConfig) -> Self {
        Self::with_log_store(id, config, Arc::new(InMemLogStore::new()))
    }

    pub fn with_log_store(id: ServerId, config: ClusterConfig, log_store: Arc<dyn LogStore>) -> Self {
        Self {
            id,
            config: Mutex::new(Arc::new(config)),
            state: Mutex::new(None),
            log_store,
            exit_code: Mutex::new(None),
        }
    }

    /// Exit code passed to `system_exit`, if it was called
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn saved_state(&self) -> Option<SrvState> {
        *self.state.lock()
    }

    pub fn log_store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.log_store)
    }
}

impl StateManager for InMemoryStateManager {
    fn load_config(&self) -> io::Result<Arc<ClusterConfig>> {
        Ok(Arc::clone(&self.config.lock()))
    }

    fn save_config(&self, config: &ClusterConfig) -> io::Result<()> {
        *self.config.lock() = Arc::new(config.clone());
        Ok(())
    }

    fn save_state(&self, state: &SrvState) -> io::Result<()> {
        *self.state.lock() = Some(*state);
        Ok(())
    }

    fn read_state(&self) -> io::Result<Option<SrvState>> {
        Ok(*self.state.lock())
    }

    fn load_log_store(&self) -> io::Result<Arc<dyn LogStore>> {
        Ok(Arc::clone(&self.log_store))
    }

    fn server_id(&self) -> ServerId {
        self.id
    }

    fn system_exit(&self, exit_code: i32) {
        info!(id = self.id, exit_code, "system exit requested");
        *self.exit_code.lock() = Some(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_config::SrvConfig;

    #[test]
    fn state_is_none_until_saved() {
        let mgr = InMemoryStateManager::new(1, ClusterConfig::default());
        assert_eq!(mgr.read_state().unwrap(), None);
        mgr.save_state(&SrvState::new(2, Some(1), 0)).unwrap();
        assert_eq!(mgr.read_state().unwrap(), Some(SrvState::new(2, Some(1), 0)));
    }

    #[test]
    fn saved_config_is_loaded_back() {
        let mgr = InMemoryStateManager::new(1, ClusterConfig::default());
        let mut conf = ClusterConfig::with_servers([SrvConfig::new(1, "a")]);
        conf.set_log_idx(3);
        mgr.save_config(&conf).unwrap();
        assert_eq!(*mgr.load_config().unwrap(), conf);
    }

    #[test]
    fn log_store_is_shared() {
        let mgr = InMemoryStateManager::new(1, ClusterConfig::default());
        let a = mgr.load_log_store().unwrap();
        let b = mgr.load_log_store().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn exit_is_recorded() {
        let mgr = InMemoryStateManager::new(1, ClusterConfig::default());
        mgr.system_exit(-1);
        assert_eq!(mgr.exit_code(), Some(-1));
    }
}
