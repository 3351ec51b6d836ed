//! Contracts for the team collection's external collaborators.
//!
//! The collection never talks to the cluster directly; everything flows
//! through these traits so the control logic can be driven in-process by the
//! integration tests and wired to real transports by the host.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;
use crate::locality::Locality;
use crate::types::{
    AddressExclusion, EngineType, KeyRange, ProcessClass, ServerMetrics, Uid,
};

/// Persistent control keys read and watched by the collection. Per-region
/// keys get the region suffix appended.
pub const MODE_KEY: &str = "data_distribution_mode";
pub const WIGGLE_KEY: &str = "perpetual_storage_wiggle";
pub const WIGGLING_PID_KEY: &str = "wiggling_storage_process";
pub const HEALTHY_ZONE_KEY: &str = "healthy_zone";

/// Healthy-zone sentinel that suppresses all failure reaction.
pub const IGNORE_SS_FAILURES: &str = "ignore_ss_failures";

/// One row of the server-list key range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListEntry {
    pub id: Uid,
    pub endpoint: SocketAddr,
    pub secondary_endpoint: Option<SocketAddr>,
    pub locality: Locality,
    pub process_class: ProcessClass,
    pub engine: EngineType,
    /// Commit version at which the server joined the cluster.
    pub added_version: u64,
    /// For a test storage server, the id of the live server it shadows.
    pub tss_pair_of: Option<Uid>,
}

impl ServerListEntry {
    pub fn is_tss(&self) -> bool {
        self.tss_pair_of.is_some()
    }
}

/// One row of the shard-assignment key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    pub range: KeyRange,
    pub primary_src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_src: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
}

impl ShardAssignment {
    pub fn has_dest(&self) -> bool {
        !self.primary_dest.is_empty() || !self.remote_dest.is_empty()
    }
}

/// Snapshot of the operator exclusion key ranges, already expanded from
/// locality expressions to addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSnapshot {
    pub excluded: Vec<AddressExclusion>,
    pub failed: Vec<AddressExclusion>,
}

/// Maintenance-zone value: failures in `zone_id` are ignored until the
/// cluster version passes `end_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthyZone {
    pub zone_id: String,
    pub end_version: u64,
}

impl HealthyZone {
    pub fn ignores_all_failures(&self) -> bool {
        self.zone_id == IGNORE_SS_FAILURES
    }
}

/// The transactional store holding cluster metadata: server list, shard
/// assignments, and the watched control keys. Writes retry internally; a
/// returned error is final.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Current read version of the store.
    async fn read_version(&self) -> Result<u64>;

    async fn server_list(&self) -> Result<Vec<ServerListEntry>>;

    async fn shard_assignments(&self) -> Result<Vec<ShardAssignment>>;

    /// Remove a server (and its TSS pair entry) from the server list via the
    /// move-keys protocol.
    async fn remove_server(&self, id: Uid, tss_pair: Option<Uid>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Subscribe to changes of a control key. The receiver yields the latest
    /// value; an initial value is always present.
    fn subscribe(&self, key: &str) -> watch::Receiver<Option<String>>;

    async fn read_exclusions(&self) -> Result<ExclusionSnapshot>;

    /// Bumped whenever either exclusion key range changes.
    fn subscribe_exclusions(&self) -> watch::Receiver<u64>;
}

/// Request for one candidate worker from the cluster controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecruitStorageRequest {
    pub excluded: Vec<AddressExclusion>,
    pub include_dcs: Vec<String>,
    /// Set when no healthy team exists; the controller may hand out workers
    /// it would otherwise hold back.
    pub critical: bool,
}

/// A worker offered by the cluster controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateWorker {
    pub worker_id: Uid,
    pub endpoint: SocketAddr,
    pub secondary_endpoint: Option<SocketAddr>,
    pub locality: Locality,
    pub process_class: ProcessClass,
}

/// Payload of the initialize-storage RPC sent to a candidate worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeStorageRequest {
    pub engine: EngineType,
    pub interface_id: Uid,
    /// When recruiting a TSS: the paired server's id and added version.
    pub tss_pair: Option<(Uid, u64)>,
}

/// The cluster controller plus the worker- and storage-side RPC surface.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Ask for one candidate worker matching the request. Long-polls until
    /// the controller has something to offer.
    async fn recruit_storage(&self, req: RecruitStorageRequest) -> Result<CandidateWorker>;

    async fn initialize_storage(
        &self,
        worker: &CandidateWorker,
        req: InitializeStorageRequest,
    ) -> Result<ServerListEntry>;

    async fn server_metrics(&self, id: Uid) -> Result<ServerMetrics>;

    /// Engine the server is actually running; may lag the configured engine.
    async fn engine_type(&self, id: Uid) -> Result<EngineType>;
}

/// Edge-triggered availability of endpoints, as seen by the failure monitor.
pub trait FailureMonitor: Send + Sync {
    /// Availability of the server's wait-failure endpoint. The receiver
    /// holds the current state and updates on every transition.
    fn availability(&self, endpoint: SocketAddr) -> watch::Receiver<bool>;
}

/// Read-only view of the shard→team mapping owned by the move queue.
pub trait ShardMap: Send + Sync {
    /// Shards currently assigned to the given team in this region.
    fn shards_for_team(&self, servers: &[Uid], primary: bool) -> Vec<KeyRange>;

    /// Teams (primary, remote) currently responsible for a shard. A shard in
    /// motion can map to several teams per region.
    fn teams_for_shard(&self, range: &KeyRange) -> (Vec<Vec<Uid>>, Vec<Vec<Uid>>);

    /// Number of shards still referencing a server.
    fn shard_count(&self, server: Uid) -> usize;

    /// Last known byte size of a shard.
    fn shard_bytes(&self, range: &KeyRange) -> u64;

    /// Relocations in flight for unhealthy reasons; feeds the wiggle guard.
    fn unhealthy_relocations(&self) -> usize;
}
