//! Shared in-memory collaborators for driving a full team collection.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use shardherd::collection::Collaborators;
use shardherd::external::{
    CandidateWorker, ExclusionSnapshot, FailureMonitor, InitializeStorageRequest, MetaStore,
    RecruitStorageRequest, ServerListEntry, ShardAssignment, ShardMap, WorkerPool,
};
use shardherd::locality::Locality;
use shardherd::state::CollectionState;
use shardherd::types::{
    AddressExclusion, EngineType, KeyRange, ProcessClass, RelocateShard, Region, ServerMetrics,
};
use shardherd::{DdError, Result, TeamCollection, TeamCollectionConfig, Uid};

/// Production config with every delay shrunk for tests.
pub fn fast_config() -> TeamCollectionConfig {
    let mut cfg = TeamCollectionConfig::triple();
    cfg.available_space_update_delay = Duration::from_millis(20);
    cfg.initial_failure_reaction_delay = Duration::from_millis(100);
    cfg.failure_reaction_time = Duration::from_millis(50);
    cfg.all_data_removed_delay = Duration::from_millis(10);
    cfg.max_read_transaction_life_versions = 100;
    cfg.zero_server_left_log_delay = Duration::from_millis(100);
    cfg.storage_recruitment_delay = Duration::from_millis(30);
    cfg.tss_recruitment_timeout = Duration::from_millis(500);
    cfg.tss_check_interval = Duration::from_millis(50);
    cfg.server_list_delay = Duration::from_millis(20);
    cfg.metrics_polling_delay = Duration::from_millis(20);
    cfg.metrics_polling_jitter = Duration::from_millis(5);
    cfg.remove_machine_team_delay = Duration::from_millis(200);
    cfg.remove_server_team_delay = Duration::from_millis(200);
    cfg.remove_team_extra_delay = Duration::from_millis(20);
    cfg.remove_wrong_engine_delay = Duration::from_millis(100);
    cfg.perpetual_wiggle_delay = Duration::from_millis(30);
    cfg.check_team_delay = Duration::from_millis(25);
    cfg.stall_check_delay = Duration::from_millis(10);
    cfg.rng_seed = 7;
    cfg
}

pub fn uid(n: u64) -> Uid {
    Uid(n, n)
}

pub fn addr(n: u64) -> SocketAddr {
    format!("10.1.{}.{}:4500", n / 250, (n % 250) + 1).parse().unwrap()
}

/// A storage server entry on its own zone and process.
pub fn entry(n: u64, zone: &str) -> ServerListEntry {
    entry_with(n, zone, &format!("p{n}"), "dc1", "hallA")
}

pub fn entry_with(n: u64, zone: &str, process: &str, dc: &str, hall: &str) -> ServerListEntry {
    ServerListEntry {
        id: uid(n),
        endpoint: addr(n),
        secondary_endpoint: None,
        locality: Locality::new(dc, hall, zone, process),
        process_class: ProcessClass::Storage,
        engine: EngineType::LsmTree,
        added_version: 100,
        tss_pair_of: None,
    }
}

// ---- metadata store ----------------------------------------------------

#[derive(Default)]
struct MetaInner {
    version: u64,
    servers: Vec<ServerListEntry>,
    shards: Vec<ShardAssignment>,
    keys: HashMap<String, String>,
    exclusions: ExclusionSnapshot,
    removed: Vec<Uid>,
}

pub struct TestMeta {
    inner: Mutex<MetaInner>,
    key_watches: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
    exclusion_epoch: watch::Sender<u64>,
}

impl TestMeta {
    pub fn new(servers: Vec<ServerListEntry>) -> Arc<Self> {
        Arc::new(TestMeta {
            inner: Mutex::new(MetaInner {
                version: 1_000,
                servers,
                ..Default::default()
            }),
            key_watches: Mutex::new(HashMap::new()),
            exclusion_epoch: watch::channel(0).0,
        })
    }

    pub fn advance_version(&self, by: u64) {
        self.inner.lock().unwrap().version += by;
    }

    pub fn set_shards(&self, shards: Vec<ShardAssignment>) {
        self.inner.lock().unwrap().shards = shards;
    }

    pub fn push_server(&self, entry: ServerListEntry) {
        self.inner.lock().unwrap().servers.push(entry);
    }

    pub fn replace_server(&self, entry: ServerListEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.servers.retain(|e| e.id != entry.id);
        inner.servers.push(entry);
    }

    pub fn set_exclusions(
        &self,
        excluded: Vec<AddressExclusion>,
        failed: Vec<AddressExclusion>,
    ) {
        self.inner.lock().unwrap().exclusions = ExclusionSnapshot { excluded, failed };
        self.exclusion_epoch.send_modify(|e| *e += 1);
    }

    pub fn removed_servers(&self) -> Vec<Uid> {
        self.inner.lock().unwrap().removed.clone()
    }

    fn sender_for(&self, key: &str) -> watch::Sender<Option<String>> {
        let mut watches = self.key_watches.lock().unwrap();
        watches
            .entry(key.to_string())
            .or_insert_with(|| {
                let current = self.inner.lock().unwrap().keys.get(key).cloned();
                watch::channel(current).0
            })
            .clone()
    }
}

#[async_trait]
impl MetaStore for TestMeta {
    async fn read_version(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().version)
    }

    async fn server_list(&self) -> Result<Vec<ServerListEntry>> {
        Ok(self.inner.lock().unwrap().servers.clone())
    }

    async fn shard_assignments(&self) -> Result<Vec<ShardAssignment>> {
        Ok(self.inner.lock().unwrap().shards.clone())
    }

    async fn remove_server(&self, id: Uid, tss_pair: Option<Uid>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.servers.retain(|e| e.id != id && Some(e.id) != tss_pair);
        inner.removed.push(id);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().keys.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .insert(key.to_string(), value.to_string());
        let _ = self.sender_for(key).send(Some(value.to_string()));
        Ok(())
    }

    fn subscribe(&self, key: &str) -> watch::Receiver<Option<String>> {
        self.sender_for(key).subscribe()
    }

    async fn read_exclusions(&self) -> Result<ExclusionSnapshot> {
        Ok(self.inner.lock().unwrap().exclusions.clone())
    }

    fn subscribe_exclusions(&self) -> watch::Receiver<u64> {
        self.exclusion_epoch.subscribe()
    }
}

// ---- worker pool -------------------------------------------------------

struct WorkersInner {
    candidates: VecDeque<CandidateWorker>,
    metrics: HashMap<Uid, ServerMetrics>,
    engines: HashMap<Uid, EngineType>,
    init_errors: VecDeque<DdError>,
    initialized: Vec<ServerListEntry>,
}

pub struct TestWorkers {
    inner: Mutex<WorkersInner>,
    meta: Arc<TestMeta>,
    next_version: AtomicU64,
    default_engine: EngineType,
}

impl TestWorkers {
    pub fn new(meta: Arc<TestMeta>) -> Arc<Self> {
        Arc::new(TestWorkers {
            inner: Mutex::new(WorkersInner {
                candidates: VecDeque::new(),
                metrics: HashMap::new(),
                engines: HashMap::new(),
                init_errors: VecDeque::new(),
                initialized: Vec::new(),
            }),
            meta,
            next_version: AtomicU64::new(2_000),
            default_engine: EngineType::LsmTree,
        })
    }

    pub fn offer_candidate(&self, n: u64, dc: &str, hall: &str) {
        let worker = CandidateWorker {
            worker_id: uid(9_000 + n),
            endpoint: addr(n),
            secondary_endpoint: None,
            locality: Locality::new(dc, hall, format!("z{n}"), format!("p{n}")),
            process_class: ProcessClass::Storage,
        };
        self.inner.lock().unwrap().candidates.push_back(worker);
    }

    pub fn set_metrics(&self, id: Uid, metrics: ServerMetrics) {
        self.inner.lock().unwrap().metrics.insert(id, metrics);
    }

    pub fn set_engine(&self, id: Uid, engine: EngineType) {
        self.inner.lock().unwrap().engines.insert(id, engine);
    }

    pub fn fail_next_initialize(&self, err: DdError) {
        self.inner.lock().unwrap().init_errors.push_back(err);
    }

    pub fn initialized(&self) -> Vec<ServerListEntry> {
        self.inner.lock().unwrap().initialized.clone()
    }
}

#[async_trait]
impl WorkerPool for TestWorkers {
    async fn recruit_storage(&self, req: RecruitStorageRequest) -> Result<CandidateWorker> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let position = inner.candidates.iter().position(|c| {
                    !req.excluded.iter().any(|excl| excl.covers(c.endpoint))
                });
                if let Some(position) = position {
                    return Ok(inner.candidates.remove(position).unwrap());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn initialize_storage(
        &self,
        worker: &CandidateWorker,
        req: InitializeStorageRequest,
    ) -> Result<ServerListEntry> {
        if let Some(err) = self.inner.lock().unwrap().init_errors.pop_front() {
            return Err(err);
        }
        let entry = ServerListEntry {
            id: req.interface_id,
            endpoint: worker.endpoint,
            secondary_endpoint: worker.secondary_endpoint,
            locality: worker.locality.clone(),
            process_class: worker.process_class,
            engine: req.engine,
            added_version: self.next_version.fetch_add(10, Ordering::Relaxed),
            tss_pair_of: req.tss_pair.map(|(pair, _)| pair),
        };
        self.meta.push_server(entry.clone());
        self.inner.lock().unwrap().initialized.push(entry.clone());
        Ok(entry)
    }

    async fn server_metrics(&self, id: Uid) -> Result<ServerMetrics> {
        let version = self.meta.read_version().await?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .metrics
            .get(&id)
            .copied()
            .unwrap_or(ServerMetrics {
                load_bytes: 1_000_000,
                available_bytes: 8_000_000_000,
                capacity_bytes: 10_000_000_000,
                durable_version: version,
            }))
    }

    async fn engine_type(&self, id: Uid) -> Result<EngineType> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .engines
            .get(&id)
            .copied()
            .unwrap_or(self.default_engine))
    }
}

// ---- failure monitor ---------------------------------------------------

#[derive(Default)]
pub struct TestFailureMonitor {
    endpoints: Mutex<HashMap<SocketAddr, watch::Sender<bool>>>,
}

impl TestFailureMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender_for(&self, endpoint: SocketAddr) -> watch::Sender<bool> {
        self.endpoints
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_insert_with(|| watch::channel(true).0)
            .clone()
    }

    pub fn set_available(&self, endpoint: SocketAddr, available: bool) {
        let _ = self.sender_for(endpoint).send(available);
    }
}

impl FailureMonitor for TestFailureMonitor {
    fn availability(&self, endpoint: SocketAddr) -> watch::Receiver<bool> {
        self.sender_for(endpoint).subscribe()
    }
}

// ---- shard map ---------------------------------------------------------

struct ShardEntry {
    range: KeyRange,
    primary_teams: Vec<Vec<Uid>>,
    remote_teams: Vec<Vec<Uid>>,
    bytes: u64,
}

#[derive(Default)]
pub struct TestShardMap {
    shards: Mutex<Vec<ShardEntry>>,
    unhealthy: AtomicUsize,
}

impl TestShardMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn assign(&self, range: KeyRange, team: Vec<Uid>, primary: bool, bytes: u64) {
        let mut team = team;
        team.sort();
        let mut shards = self.shards.lock().unwrap();
        if let Some(shard) = shards.iter_mut().find(|s| s.range == range) {
            if primary {
                shard.primary_teams = vec![team];
            } else {
                shard.remote_teams = vec![team];
            }
            shard.bytes = bytes;
            return;
        }
        let (primary_teams, remote_teams) =
            if primary { (vec![team], vec![]) } else { (vec![], vec![team]) };
        shards.push(ShardEntry { range, primary_teams, remote_teams, bytes });
    }

    /// Simulate the move queue finishing all drains off a server.
    pub fn drain_server(&self, id: Uid) {
        let mut shards = self.shards.lock().unwrap();
        for shard in shards.iter_mut() {
            for team in shard
                .primary_teams
                .iter_mut()
                .chain(shard.remote_teams.iter_mut())
            {
                team.retain(|s| *s != id);
            }
        }
    }

    pub fn clear(&self) {
        self.shards.lock().unwrap().clear();
    }

    pub fn set_unhealthy_relocations(&self, n: usize) {
        self.unhealthy.store(n, Ordering::Relaxed);
    }
}

impl ShardMap for TestShardMap {
    fn shards_for_team(&self, servers: &[Uid], primary: bool) -> Vec<KeyRange> {
        let mut team = servers.to_vec();
        team.sort();
        self.shards
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                let teams = if primary { &s.primary_teams } else { &s.remote_teams };
                teams.iter().any(|t| *t == team)
            })
            .map(|s| s.range.clone())
            .collect()
    }

    fn teams_for_shard(&self, range: &KeyRange) -> (Vec<Vec<Uid>>, Vec<Vec<Uid>>) {
        let shards = self.shards.lock().unwrap();
        shards
            .iter()
            .find(|s| s.range == *range)
            .map(|s| (s.primary_teams.clone(), s.remote_teams.clone()))
            .unwrap_or_default()
    }

    fn shard_count(&self, server: Uid) -> usize {
        self.shards
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.primary_teams
                    .iter()
                    .chain(s.remote_teams.iter())
                    .any(|t| t.contains(&server))
            })
            .count()
    }

    fn shard_bytes(&self, range: &KeyRange) -> u64 {
        self.shards
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.range == *range)
            .map(|s| s.bytes)
            .unwrap_or(0)
    }

    fn unhealthy_relocations(&self) -> usize {
        self.unhealthy.load(Ordering::Relaxed)
    }
}

// ---- harness -----------------------------------------------------------

pub struct TestCluster {
    pub meta: Arc<TestMeta>,
    pub workers: Arc<TestWorkers>,
    pub failure: Arc<TestFailureMonitor>,
    pub shard_map: Arc<TestShardMap>,
    pub tc: Arc<TeamCollection>,
    pub relocations: Mutex<mpsc::UnboundedReceiver<RelocateShard>>,
    pub failed_servers: Mutex<mpsc::UnboundedReceiver<Uid>>,
}

impl TestCluster {
    /// Boot a primary collection over the given server list and start every
    /// background task.
    pub async fn start(cfg: TeamCollectionConfig, servers: Vec<ServerListEntry>) -> TestCluster {
        Self::start_with(cfg, servers, Vec::new(), true).await
    }

    /// Full control over the initial shard mapping and whether the
    /// background tasks run (off keeps the post-bootstrap state inspectable).
    pub async fn start_with(
        cfg: TeamCollectionConfig,
        servers: Vec<ServerListEntry>,
        shards: Vec<ShardAssignment>,
        run_background: bool,
    ) -> TestCluster {
        let meta = TestMeta::new(servers);
        meta.set_shards(shards);
        let workers = TestWorkers::new(Arc::clone(&meta));
        let failure = TestFailureMonitor::new();
        let shard_map = TestShardMap::new();
        let (relocation_tx, relocation_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();

        let tc = TeamCollection::new(
            cfg,
            Region::Primary,
            Collaborators {
                meta: meta.clone(),
                workers: workers.clone(),
                failure_monitor: failure.clone(),
                shard_map: shard_map.clone(),
            },
            relocation_tx,
            failed_tx,
        );

        let init = shardherd::bootstrap::load_initial_data_distribution(meta.as_ref())
            .await
            .expect("initial load");
        shardherd::bootstrap::initialize(&tc, &init).await;
        if run_background {
            tc.spawn_background_tasks();
        }

        TestCluster {
            meta,
            workers,
            failure,
            shard_map,
            tc,
            relocations: Mutex::new(relocation_rx),
            failed_servers: Mutex::new(failed_rx),
        }
    }

    /// Poll the collection state until the predicate holds.
    pub async fn wait_for(&self, what: &str, predicate: impl Fn(&CollectionState) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if predicate(&self.tc.read()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}: {}", self.tc.snapshot_info());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drain currently queued relocations.
    pub fn take_relocations(&self) -> Vec<RelocateShard> {
        let mut out = Vec::new();
        let mut rx = self.relocations.lock().unwrap();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    /// Wait until a relocation at the given priority shows up.
    pub async fn wait_for_relocation(&self, priority: i32) -> RelocateShard {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            for r in self.take_relocations() {
                if r.priority == priority {
                    return r;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for relocation at priority {priority}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
