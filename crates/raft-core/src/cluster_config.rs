//! # cluster_config
//!
//! why: membership is itself replicated, so it needs a stable binary form
//! relations: stored in conf log entries, embedded in snapshots, persisted by the state manager
//! what: SrvConfig (id + endpoint), ClusterConfig with its backward chain via prev_log_idx

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, SZ_INT, SZ_ULONG};
use crate::error::BufferError;

/// Server identifier, unique inside a cluster
pub type ServerId = i32;

/// One cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrvConfig {
    id: ServerId,
    endpoint: String,
}

impl SrvConfig {
    pub fn new(id: ServerId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn serialized_len(&self) -> usize {
        SZ_INT + self.endpoint.len() + 1
    }

    pub(crate) fn write_to(&self, buf: &mut Buffer) -> Result<(), BufferError> {
        buf.put_i32(self.id)?;
        buf.put_str(&self.endpoint)
    }

    pub(crate) fn read_from(buf: &mut Buffer) -> Result<Self, BufferError> {
        let id = buf.get_i32()?;
        let endpoint = buf.get_str()?;
        Ok(Self { id, endpoint })
    }

    /// `[id:i32][endpoint:NUL string]`
    pub fn serialize(&self) -> Result<Buffer, BufferError> {
        let mut buf = Buffer::alloc(self.serialized_len());
        self.write_to(&mut buf)?;
        buf.set_pos(0);
        Ok(buf)
    }

    pub fn deserialize(buf: &mut Buffer) -> Result<Self, BufferError> {
        Self::read_from(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        Self::deserialize(&mut Buffer::from_vec(bytes.to_vec()))
    }
}

/// Cluster membership as of log index `log_idx`.
///
/// `prev_log_idx` points at the configuration this one replaced, so older
/// configurations can be found by walking back through the log.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    log_idx: u64,
    prev_log_idx: u64,
    servers: Vec<SrvConfig>,
}

impl ClusterConfig {
    pub fn new(log_idx: u64, prev_log_idx: u64) -> Self {
        Self {
            log_idx,
            prev_log_idx,
            servers: Vec::new(),
        }
    }

    /// Unlogged bootstrap configuration holding `servers`.
    pub fn with_servers(servers: impl IntoIterator<Item = SrvConfig>) -> Self {
        Self {
            log_idx: 0,
            prev_log_idx: 0,
            servers: servers.into_iter().collect(),
        }
    }

    pub fn log_idx(&self) -> u64 {
        self.log_idx
    }

    pub fn prev_log_idx(&self) -> u64 {
        self.prev_log_idx
    }

    /// Move the current index into `prev_log_idx` and take `log_idx`.
    pub fn set_log_idx(&mut self, log_idx: u64) {
        self.prev_log_idx = self.log_idx;
        self.log_idx = log_idx;
    }

    pub fn servers(&self) -> &[SrvConfig] {
        &self.servers
    }

    pub fn add_server(&mut self, srv: SrvConfig) {
        self.servers.push(srv);
    }

    pub fn get_server(&self, id: ServerId) -> Option<&SrvConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get_server(id).is_some()
    }

    pub(crate) fn serialized_len(&self) -> usize {
        SZ_ULONG * 2
            + SZ_INT
            + self
                .servers
                .iter()
                .map(SrvConfig::serialized_len)
                .sum::<usize>()
    }

    pub(crate) fn write_to(&self, buf: &mut Buffer) -> Result<(), BufferError> {
        let count = i32::try_from(self.servers.len())
            .map_err(|_| BufferError::Malformed("server count"))?;
        buf.put_u64(self.log_idx)?;
        buf.put_u64(self.prev_log_idx)?;
        buf.put_i32(count)?;
        for srv in &self.servers {
            srv.write_to(buf)?;
        }
        Ok(())
    }

    pub(crate) fn read_from(buf: &mut Buffer) -> Result<Self, BufferError> {
        let log_idx = buf.get_u64()?;
        let prev_log_idx = buf.get_u64()?;
        let count = buf.get_i32()?;
        if count < 0 {
            return Err(BufferError::Malformed("server count"));
        }
        // a server takes at least an id and the endpoint terminator
        let mut servers = Vec::with_capacity((count as usize).min(buf.remaining() / (SZ_INT + 1)));
        for _ in 0..count {
            servers.push(SrvConfig::read_from(buf)?);
        }
        Ok(Self {
            log_idx,
            prev_log_idx,
            servers,
        })
    }

    /// `[log_idx:u64][prev_log_idx:u64][server_count:i32][srv_config...]`
    pub fn serialize(&self) -> Result<Buffer, BufferError> {
        let mut buf = Buffer::alloc(self.serialized_len());
        self.write_to(&mut buf)?;
        buf.set_pos(0);
        Ok(buf)
    }

    pub fn deserialize(buf: &mut Buffer) -> Result<Self, BufferError> {
        Self::read_from(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        Self::deserialize(&mut Buffer::from_vec(bytes.to_vec()))
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_servers() -> ClusterConfig {
        let mut conf = ClusterConfig::new(10, 4);
        conf.add_server(SrvConfig::new(1, "tcp://127.0.0.1:9001"));
        conf.add_server(SrvConfig::new(2, "tcp://127.0.0.1:9002"));
        conf.add_server(SrvConfig::new(3, "tcp://127.0.0.1:9003"));
        conf
    }

    #[test]
    fn srv_config_layout() {
        let buf = SrvConfig::new(258, "ab").serialize().unwrap();
        assert_eq!(buf.as_slice(), &[2, 1, 0, 0, b'a', b'b', 0][..]);
    }

    #[test]
    fn config_round_trip() {
        let conf = three_servers();
        let mut buf = conf.serialize().unwrap();
        assert_eq!(buf.size(), conf.serialized_len());
        let back = ClusterConfig::deserialize(&mut buf).unwrap();
        assert_eq!(back, conf);
        assert_eq!(back.get_server(2).unwrap().endpoint(), "tcp://127.0.0.1:9002");
    }

    #[test]
    fn set_log_idx_links_previous() {
        let mut conf = three_servers();
        conf.set_log_idx(15);
        assert_eq!(conf.log_idx(), 15);
        assert_eq!(conf.prev_log_idx(), 10);
    }

    #[test]
    fn truncated_config_is_rejected() {
        let raw = three_servers().serialize().unwrap().into_vec();
        assert!(ClusterConfig::from_bytes(&raw[..raw.len() - 1]).is_err());
    }

    #[test]
    fn negative_server_count_is_rejected() {
        let mut raw = ClusterConfig::new(1, 0).serialize().unwrap().into_vec();
        raw[16..20].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(
            ClusterConfig::from_bytes(&raw),
            Err(BufferError::Malformed("server count"))
        );
    }

    #[test]
    fn huge_server_count_is_a_decode_error() {
        let mut raw = three_servers().serialize().unwrap().into_vec();
        raw[16..20].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(ClusterConfig::from_bytes(&raw).is_err());
    }

    #[test]
    fn json_form_for_state_files() {
        let conf = three_servers();
        let json = serde_json::to_string(&conf).unwrap();
        let back: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);
    }
}
