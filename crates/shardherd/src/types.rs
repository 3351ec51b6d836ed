//! Core identifiers and wire-adjacent value types shared across the crate.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque 128-bit identity for storage servers, teams, and requests.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u64, pub u64);

impl Uid {
    pub fn random(rng: &mut impl Rng) -> Self {
        Uid(rng.gen(), rng.gen())
    }

    /// Abbreviated form used in log fields.
    pub fn short(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.0, self.1)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lexicographic key range, end-exclusive. An empty `end` means unbounded.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        KeyRange { begin: begin.into(), end: end.into() }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.begin),
            String::from_utf8_lossy(&self.end)
        )
    }
}

/// Storage engine backing a server. `Unset` until the server first reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineType {
    Unset,
    LsmTree,
    BTree,
    InMemory,
}

/// Worker process class, used to judge fitness for the storage role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessClass {
    Unset,
    Storage,
    Transaction,
    Stateless,
}

/// Fitness of a process class for a role; lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fitness {
    Best,
    Good,
    Neutral,
    Worst,
}

impl ProcessClass {
    /// Fitness of this class for hosting a storage server.
    pub fn storage_fitness(&self) -> Fitness {
        match self {
            ProcessClass::Storage => Fitness::Best,
            ProcessClass::Unset => Fitness::Neutral,
            ProcessClass::Stateless => Fitness::Worst,
            ProcessClass::Transaction => Fitness::Worst,
        }
    }
}

/// An exclusion expression: a whole IP, or one IP+port endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressExclusion {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl AddressExclusion {
    pub fn endpoint(addr: SocketAddr) -> Self {
        AddressExclusion { ip: addr.ip(), port: Some(addr.port()) }
    }

    pub fn ip_only(ip: IpAddr) -> Self {
        AddressExclusion { ip, port: None }
    }

    /// Whether the exclusion covers the given endpoint.
    pub fn covers(&self, addr: SocketAddr) -> bool {
        self.ip == addr.ip() && self.port.map_or(true, |p| p == addr.port())
    }
}

impl fmt::Debug for AddressExclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}", self.ip),
        }
    }
}

impl fmt::Display for AddressExclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Severity-ordered exclusion state of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExclusionStatus {
    None,
    Wiggling,
    Excluded,
    Failed,
}

/// Live status of a storage server as judged by its tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStatus {
    pub failed: bool,
    pub undesired: bool,
    pub wiggling: bool,
    pub wrong_configuration: bool,
}

impl ServerStatus {
    pub fn is_unhealthy(&self) -> bool {
        self.failed || self.undesired
    }

    /// Whether recruitment on this server's address must be avoided. A failed
    /// process may have restarted without its server, and a wrong-configured
    /// server will be removed anyway.
    pub fn exclude_on_recruit(&self) -> bool {
        !self.failed && !self.wrong_configuration
    }
}

/// Relocation priority buckets consumed by the external move queue.
///
/// Larger is more urgent. The gaps leave room for queue-internal buckets.
pub mod priority {
    pub const REBALANCE_UNDERUTILIZED_TEAM: i32 = 120;
    pub const REBALANCE_OVERUTILIZED_TEAM: i32 = 121;
    pub const TEAM_HEALTHY: i32 = 140;
    pub const PERPETUAL_STORAGE_WIGGLE: i32 = 141;
    pub const TEAM_CONTAINS_UNDESIRED_SERVER: i32 = 150;
    pub const TEAM_REDUNDANT: i32 = 200;
    pub const POPULATE_REGION: i32 = 600;
    pub const TEAM_UNHEALTHY: i32 = 700;
    pub const TEAM_2_LEFT: i32 = 709;
    pub const TEAM_1_LEFT: i32 = 800;
    pub const TEAM_FAILED: i32 = 805;
    pub const TEAM_0_LEFT: i32 = 809;
}

/// A relocation request emitted to the move queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
}

/// Byte-level metrics last reported by a storage server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub load_bytes: i64,
    pub available_bytes: i64,
    pub capacity_bytes: i64,
    /// Most recent version the server has made durable.
    pub durable_version: u64,
}

/// Which of the two symmetric collections this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Primary,
    Remote,
}

impl Region {
    pub fn is_primary(&self) -> bool {
        matches!(self, Region::Primary)
    }

    /// Suffix used on per-region persistent keys.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Region::Primary => "/primary",
            Region::Remote => "/remote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_status_orders_by_severity() {
        assert!(ExclusionStatus::None < ExclusionStatus::Wiggling);
        assert!(ExclusionStatus::Wiggling < ExclusionStatus::Excluded);
        assert!(ExclusionStatus::Excluded < ExclusionStatus::Failed);
    }

    #[test]
    fn ip_exclusion_covers_all_ports() {
        let addr: SocketAddr = "10.0.0.7:4500".parse().unwrap();
        assert!(AddressExclusion::ip_only(addr.ip()).covers(addr));
        assert!(AddressExclusion::endpoint(addr).covers(addr));
        let other: SocketAddr = "10.0.0.7:4501".parse().unwrap();
        assert!(!AddressExclusion::endpoint(addr).covers(other));
    }

    #[test]
    fn unhealthy_is_failed_or_undesired() {
        let mut s = ServerStatus::default();
        assert!(!s.is_unhealthy());
        s.undesired = true;
        assert!(s.is_unhealthy());
        s = ServerStatus { failed: true, ..Default::default() };
        assert!(s.is_unhealthy());
    }
}
