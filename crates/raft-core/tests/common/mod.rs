//! # test harness
//!
//! why: run real raft servers against each other without a network
//! relations: shared by the integration test files of raft-core
//! what: in-process message bus, recording state machine, cluster builder

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raft_core::{
    Buffer, ClusterConfig, Context, InMemLogStore, InMemoryStateManager, LogEntry, LogStore,
    LogStoreError, MsgHandler, MsgType, RaftParams, RaftServer, ReqMsg, RpcClient, RpcClientFactory,
    RpcError, RpcResult, ServerId, Snapshot, SnapshotHandler, SrvConfig, StateMachine, TokioScheduler,
};
use tokio::runtime::Handle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` every 10ms until it holds or `timeout` runs out.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub fn endpoint(id: ServerId) -> String {
    format!("mem://{id}")
}

// =============================================================================
// MESSAGE BUS
// =============================================================================

/// Routes requests between servers in the same process. Servers marked down
/// neither receive nor send.
pub struct Bus {
    handle: Handle,
    servers: Mutex<HashMap<String, Weak<RaftServer>>>,
    down: Mutex<HashSet<ServerId>>,
}

impl Bus {
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            servers: Mutex::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, server: &Arc<RaftServer>) {
        self.servers
            .lock()
            .insert(endpoint(server.id()), Arc::downgrade(server));
    }

    pub fn set_down(&self, id: ServerId, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    fn is_down(&self, id: ServerId) -> bool {
        self.down.lock().contains(&id)
    }
}

struct BusClient {
    bus: Arc<Bus>,
    endpoint: String,
}

impl RpcClient for BusClient {
    fn send(&self, req: ReqMsg) -> Arc<RpcResult> {
        let result = Arc::new(RpcResult::new());
        let completion = Arc::clone(&result);
        let bus = Arc::clone(&self.bus);
        let endpoint = self.endpoint.clone();
        self.bus.handle.spawn_blocking(move || {
            let target = bus.servers.lock().get(&endpoint).and_then(Weak::upgrade);
            let outcome = match target {
                Some(server) if !bus.is_down(server.id()) && !bus.is_down(req.src()) => server
                    .process_req(req)
                    .map_err(|err| RpcError::Remote(err.to_string())),
                _ => Err(RpcError::ConnectionFailed(endpoint)),
            };
            completion.set_result(outcome);
        });
        result
    }
}

struct BusClientFactory {
    bus: Arc<Bus>,
}

impl RpcClientFactory for BusClientFactory {
    fn create_client(&self, endpoint: &str) -> Arc<dyn RpcClient> {
        Arc::new(BusClient {
            bus: Arc::clone(&self.bus),
            endpoint: endpoint.to_string(),
        })
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Default)]
struct Recorded {
    committed: Vec<(u64, Vec<u8>)>,
    pre_committed: Vec<(u64, Vec<u8>)>,
    rolled_back: Vec<(u64, Vec<u8>)>,
    images: BTreeMap<u64, Vec<u8>>,
    receiving: Vec<u8>,
    last_snapshot: Option<Arc<Snapshot>>,
}

/// Remembers every callback; snapshots are the json encoded committed list.
#[derive(Default)]
pub struct RecordingStateMachine {
    inner: Mutex<Recorded>,
}

impl RecordingStateMachine {
    pub fn committed_payloads(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .committed
            .iter()
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn committed(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner.lock().committed.clone()
    }

    pub fn pre_committed(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner.lock().pre_committed.clone()
    }

    pub fn rolled_back(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner.lock().rolled_back.clone()
    }

    pub fn snapshot_idx(&self) -> Option<u64> {
        self.inner
            .lock()
            .last_snapshot
            .as_ref()
            .map(|snp| snp.last_log_idx())
    }
}

impl StateMachine for RecordingStateMachine {
    fn commit(&self, log_idx: u64, data: &[u8]) {
        self.inner.lock().committed.push((log_idx, data.to_vec()));
    }

    fn pre_commit(&self, log_idx: u64, data: &[u8]) {
        self.inner.lock().pre_committed.push((log_idx, data.to_vec()));
    }

    fn rollback(&self, log_idx: u64, data: &[u8]) {
        self.inner.lock().rolled_back.push((log_idx, data.to_vec()));
    }

    fn save_snapshot_data(&self, _snapshot: &Snapshot, offset: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let offset = offset as usize;
        if offset == 0 {
            inner.receiving.clear();
        }
        inner.receiving.truncate(offset);
        inner.receiving.extend_from_slice(data);
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> bool {
        let mut inner = self.inner.lock();
        let image = std::mem::take(&mut inner.receiving);
        let Ok(committed) = serde_json::from_slice::<Vec<(u64, Vec<u8>)>>(&image) else {
            return false;
        };
        inner.committed = committed;
        inner.images.insert(snapshot.last_log_idx(), image);
        inner.last_snapshot = Some(Arc::new(snapshot.clone()));
        true
    }

    fn read_snapshot_data(&self, snapshot: &Snapshot, offset: u64, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock();
        let Some(image) = inner.images.get(&snapshot.last_log_idx()) else {
            return 0;
        };
        let start = (offset as usize).min(image.len());
        let len = buf.len().min(image.len() - start);
        buf[..len].copy_from_slice(&image[start..start + len]);
        len
    }

    fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.lock().last_snapshot.clone()
    }

    fn create_snapshot(&self, snapshot: Arc<Snapshot>, when_done: SnapshotHandler) {
        let created = {
            let mut inner = self.inner.lock();
            let covered: Vec<(u64, Vec<u8>)> = inner
                .committed
                .iter()
                .filter(|(idx, _)| *idx <= snapshot.last_log_idx())
                .cloned()
                .collect();
            match serde_json::to_vec(&covered) {
                Ok(image) => {
                    let mut snp = (*snapshot).clone();
                    snp.set_size(image.len() as u64);
                    inner.images.insert(snp.last_log_idx(), image);
                    inner.last_snapshot = Some(Arc::new(snp));
                    Ok(true)
                }
                Err(err) => Err(raft_core::SnapshotError(err.to_string())),
            }
        };
        when_done(created);
    }
}

// =============================================================================
// LOG STORE
// =============================================================================

/// In-memory log whose `entry_at` can be told to fail once for one index.
#[derive(Default)]
pub struct FlakyLogStore {
    inner: InMemLogStore,
    fail_at: Mutex<Option<u64>>,
    failures: Mutex<u32>,
}

impl FlakyLogStore {
    pub fn fail_once_at(&self, index: u64) {
        *self.fail_at.lock() = Some(index);
    }

    pub fn failures(&self) -> u32 {
        *self.failures.lock()
    }
}

impl LogStore for FlakyLogStore {
    fn next_slot(&self) -> u64 {
        self.inner.next_slot()
    }

    fn start_index(&self) -> u64 {
        self.inner.start_index()
    }

    fn last_entry(&self) -> LogEntry {
        self.inner.last_entry()
    }

    fn append(&self, entry: &LogEntry) -> Result<u64, LogStoreError> {
        self.inner.append(entry)
    }

    fn write_at(&self, index: u64, entry: &LogEntry) -> Result<(), LogStoreError> {
        self.inner.write_at(index, entry)
    }

    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, LogStoreError> {
        self.inner.entries(start, end)
    }

    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, LogStoreError> {
        let mut fail_at = self.fail_at.lock();
        if *fail_at == Some(index) {
            *fail_at = None;
            *self.failures.lock() += 1;
            return Err(LogStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk hiccup",
            )));
        }
        drop(fail_at);
        self.inner.entry_at(index)
    }

    fn term_at(&self, index: u64) -> u64 {
        self.inner.term_at(index)
    }

    fn pack(&self, index: u64, count: u64) -> Result<Buffer, LogStoreError> {
        self.inner.pack(index, count)
    }

    fn apply_pack(&self, index: u64, pack: &Buffer) -> Result<(), LogStoreError> {
        self.inner.apply_pack(index, pack)
    }

    fn compact(&self, last_log_index: u64) -> bool {
        self.inner.compact(last_log_index)
    }
}

// =============================================================================
// CLUSTER
// =============================================================================

pub struct Node {
    pub server: Arc<RaftServer>,
    pub state_machine: Arc<RecordingStateMachine>,
    pub state_mgr: Arc<InMemoryStateManager>,
}

impl Node {
    pub fn id(&self) -> ServerId {
        self.server.id()
    }
}

pub fn fast_params() -> RaftParams {
    RaftParams::default()
        .with_election_timeout_lower(150)
        .with_election_timeout_upper(300)
        .with_hb_interval(40)
        .with_rpc_failure_backoff(20)
}

/// Servers on one bus and one scheduler, bootstrapped with the same config.
pub struct Cluster {
    pub scheduler: Arc<TokioScheduler>,
    pub bus: Arc<Bus>,
    pub nodes: BTreeMap<ServerId, Node>,
    params: RaftParams,
}

impl Cluster {
    pub fn new(ids: &[ServerId], params: RaftParams) -> Self {
        init_tracing();
        let scheduler = Arc::new(TokioScheduler::new(4).expect("runtime"));
        let bus = Bus::new(scheduler.handle().clone());
        let mut cluster = Self {
            scheduler,
            bus,
            nodes: BTreeMap::new(),
            params,
        };
        let config = ClusterConfig::with_servers(ids.iter().map(|id| SrvConfig::new(*id, endpoint(*id))));
        for id in ids {
            cluster.start(*id, config.clone());
        }
        cluster
    }

    /// Start a server with `config` as its stored configuration.
    pub fn start(&mut self, id: ServerId, config: ClusterConfig) -> &Node {
        self.start_with_store(id, config, Arc::new(InMemLogStore::new()))
    }

    pub fn start_with_store(&mut self, id: ServerId, config: ClusterConfig, log_store: Arc<dyn LogStore>) -> &Node {
        let state_mgr = Arc::new(InMemoryStateManager::with_log_store(id, config, log_store));
        let state_machine = Arc::new(RecordingStateMachine::default());
        let ctx = Context::new(
            state_mgr.clone(),
            state_machine.clone(),
            Arc::new(BusClientFactory {
                bus: Arc::clone(&self.bus),
            }),
            self.scheduler.clone(),
            self.params.clone(),
        );
        let server = RaftServer::new(ctx).expect("server starts");
        self.bus.register(&server);
        self.nodes.insert(
            id,
            Node {
                server,
                state_machine,
                state_mgr,
            },
        );
        &self.nodes[&id]
    }

    pub fn node(&self, id: ServerId) -> &Node {
        &self.nodes[&id]
    }

    pub fn leaders(&self) -> Vec<ServerId> {
        self.nodes
            .values()
            .filter(|node| node.server.is_leader() && !node.server.is_stopped())
            .map(Node::id)
            .collect()
    }

    /// Wait for exactly one live leader and return it.
    pub fn wait_for_leader(&self, timeout: Duration) -> Option<ServerId> {
        let mut leader = None;
        wait_until(timeout, || {
            let leaders = self.leaders();
            leader = (leaders.len() == 1).then(|| leaders[0]);
            leader.is_some()
        });
        leader
    }

    /// Submit application entries through the leader.
    pub fn submit<P: AsRef<[u8]>>(&self, leader: ServerId, payloads: &[P]) -> bool {
        let entries = payloads
            .iter()
            .map(|data| LogEntry::app(0, data.as_ref().to_vec()))
            .collect();
        let req = ReqMsg::client(MsgType::ClientRequest, leader, entries);
        self.node(leader)
            .server
            .process_req(req)
            .map(|resp| resp.accepted())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.server.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
        self.scheduler.stop();
    }
}
