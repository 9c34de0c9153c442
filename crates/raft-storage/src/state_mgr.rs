//! # state_mgr
//!
//! why: term, vote and cluster configuration must be durable across restarts
//! relations: implements raft_core::StateManager, owns the FsLogStore
//! what: FileStateManager writing state.json / config.json atomically
//!
//! Directory layout:
//! - `state.json`: term, vote and commit index
//! - `config.json`: last committed (or self-removal) configuration
//! - `log/`: the log store files

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use raft_core::{ClusterConfig, LogStore, ServerId, SrvState, StateManager};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::fs_log_store::{FsLogStore, DEFAULT_BUFFER_SIZE};

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";
const LOG_DIR: &str = "log";

type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// File backed [`StateManager`].
///
/// A server bootstrapping a new cluster saves its initial configuration
/// before starting; without `config.json` an empty configuration is loaded,
/// which is what a server waiting to be added to a cluster needs.
pub struct FileStateManager {
    id: ServerId,
    dir: PathBuf,
    log_store: Arc<FsLogStore>,
    exit_hook: ExitHook,
}

impl FileStateManager {
    pub fn new(id: ServerId, dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_log_buffer_size(id, dir, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_log_buffer_size(id: ServerId, dir: impl Into<PathBuf>, buf_size: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let log_store = Arc::new(FsLogStore::open(dir.join(LOG_DIR), buf_size)?);
        Ok(Self {
            id,
            dir,
            log_store,
            exit_hook: Box::new(|code| std::process::exit(code)),
        })
    }

    /// Replace the default `std::process::exit` called by `system_exit`.
    pub fn with_exit_hook(mut self, hook: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit_hook = Box::new(hook);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fs_log_store(&self) -> Arc<FsLogStore> {
        Arc::clone(&self.log_store)
    }

    /// atomic write: write to temp file then rename
    fn write_json(&self, name: &str, value: &impl Serialize) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(name))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> io::Result<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        let value = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(value))
    }
}

impl StateManager for FileStateManager {
    fn load_config(&self) -> io::Result<Arc<ClusterConfig>> {
        let config: Option<ClusterConfig> = self.read_json(CONFIG_FILE)?;
        Ok(Arc::new(config.unwrap_or_default()))
    }

    fn save_config(&self, config: &ClusterConfig) -> io::Result<()> {
        debug!(id = self.id, log_idx = config.log_idx(), "saving configuration");
        self.write_json(CONFIG_FILE, config)
    }

    fn save_state(&self, state: &SrvState) -> io::Result<()> {
        self.write_json(STATE_FILE, state)
    }

    fn read_state(&self) -> io::Result<Option<SrvState>> {
        self.read_json(STATE_FILE)
    }

    fn load_log_store(&self) -> io::Result<Arc<dyn LogStore>> {
        Ok(self.log_store.clone())
    }

    fn server_id(&self) -> ServerId {
        self.id
    }

    fn system_exit(&self, exit_code: i32) {
        info!(id = self.id, exit_code, "raft server requested exit");
        (self.exit_hook)(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::SrvConfig;

    #[test]
    fn missing_files_give_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateManager::new(1, dir.path()).unwrap();
        assert_eq!(mgr.read_state().unwrap(), None);
        assert_eq!(*mgr.load_config().unwrap(), ClusterConfig::default());
    }

    #[test]
    fn no_temp_file_is_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateManager::new(1, dir.path()).unwrap();
        mgr.save_state(&SrvState::new(1, None, 0)).unwrap();
        mgr.save_config(&ClusterConfig::with_servers([SrvConfig::new(1, "a")]))
            .unwrap();
        assert!(dir.path().join(STATE_FILE).exists());
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn corrupted_state_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateManager::new(1, dir.path()).unwrap();
        fs::write(dir.path().join(STATE_FILE), "not json").unwrap();
        let err = mgr.read_state().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
