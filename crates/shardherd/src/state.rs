//! Registries and counters for one team collection.
//!
//! `CollectionState` owns the server, machine, server-team, and machine-team
//! registries plus the collection-wide counters. All mutations that touch
//! more than one registry go through methods here so the cross-registry
//! invariants hold after every call:
//! - a server team's machine projection equals its machine team's members
//! - `server.teams` is exactly the set of teams containing the server
//! - a machine exists iff it has at least one server
//! - `healthy_team_count` / `unhealthy_servers` match the flags they count
//!
//! Background tasks hold the collection handle and take the state lock for
//! short, non-awaiting critical sections.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::TeamCollectionConfig;
use crate::external::ServerListEntry;
use crate::locality::Locality;
use crate::types::{
    priority, AddressExclusion, EngineType, ExclusionStatus, ProcessClass, ServerMetrics,
    ServerStatus, Uid,
};

/// Machine identity: the zone id shared by its processes.
pub type MachineId = String;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(pub u64);

impl fmt::Debug for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "team-{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineTeamId(pub u64);

impl fmt::Debug for MachineTeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mteam-{}", self.0)
    }
}

/// One storage server (or TSS) known to the collection.
pub struct ServerRecord {
    pub id: Uid,
    pub endpoint: SocketAddr,
    pub secondary_endpoint: Option<SocketAddr>,
    pub locality: Locality,
    pub process_class: ProcessClass,
    pub engine: EngineType,
    pub added_version: u64,
    pub tss_pair_of: Option<Uid>,

    /// Bytes of relocations currently targeting this server.
    pub data_in_flight: i64,
    pub metrics: Option<ServerMetrics>,
    pub wrong_engine_to_remove: bool,
    pub version_too_far_behind: bool,
    pub in_desired_dc: bool,

    /// Teams containing this server; kept in sync by the team methods.
    pub teams: Vec<TeamId>,
    /// Machine the server currently sits on. `None` only for TSS.
    pub machine: Option<MachineId>,

    /// Latest tracker-computed status, mirrored in `server_status`.
    pub status_tx: watch::Sender<ServerStatus>,
    /// Pokes the server tracker to re-evaluate.
    pub wake: Arc<Notify>,
    /// Set once the record has been removed from the registries.
    pub removed_tx: watch::Sender<bool>,
    /// Kill signal for surplus TSS.
    pub kill_tss: Arc<Notify>,
    /// Cancels the server tracker.
    pub cancel: CancellationToken,
}

impl ServerRecord {
    fn from_entry(entry: ServerListEntry) -> Self {
        ServerRecord {
            id: entry.id,
            endpoint: entry.endpoint,
            secondary_endpoint: entry.secondary_endpoint,
            locality: entry.locality,
            process_class: entry.process_class,
            engine: entry.engine,
            added_version: entry.added_version,
            tss_pair_of: entry.tss_pair_of,
            data_in_flight: 0,
            metrics: None,
            wrong_engine_to_remove: false,
            version_too_far_behind: false,
            in_desired_dc: true,
            teams: Vec::new(),
            machine: None,
            status_tx: watch::channel(ServerStatus::default()).0,
            wake: Arc::new(Notify::new()),
            removed_tx: watch::channel(false).0,
            kill_tss: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_tss(&self) -> bool {
        self.tss_pair_of.is_some()
    }

    /// The three exclusion keys this server answers to, worst-match wins:
    /// endpoint, secondary endpoint, and bare IP forms.
    pub fn exclusion_addresses(&self) -> Vec<AddressExclusion> {
        let mut out = vec![
            AddressExclusion::endpoint(self.endpoint),
            AddressExclusion::ip_only(self.endpoint.ip()),
        ];
        if let Some(sec) = self.secondary_endpoint {
            out.push(AddressExclusion::endpoint(sec));
            out.push(AddressExclusion::ip_only(sec.ip()));
        }
        out
    }
}

pub struct MachineRecord {
    pub id: MachineId,
    /// Non-empty by construction; the machine is removed with its last
    /// server.
    pub servers: Vec<Uid>,
    pub machine_teams: Vec<MachineTeamId>,
}

pub struct MachineTeam {
    pub id: MachineTeamId,
    /// Sorted machine ids, `team_size` of them.
    pub machines: Vec<MachineId>,
    pub server_teams: Vec<TeamId>,
}

pub struct ServerTeam {
    pub id: TeamId,
    /// Sorted server ids, `team_size` of them (bad teams may differ).
    pub servers: Vec<Uid>,
    pub machine_team: Option<MachineTeamId>,
    pub healthy: bool,
    pub optimal: bool,
    pub wrong_configuration: bool,
    pub priority: i32,
    /// Bad teams violate size or policy and await garbage collection.
    pub bad: bool,
    /// Redundant teams were evicted by a remover, not degraded.
    pub redundant: bool,
    /// Whether a tracker task has been started for this team.
    pub tracker_started: bool,
    /// Cancels the team tracker.
    pub cancel: CancellationToken,
}

pub struct CollectionState {
    pub servers: BTreeMap<Uid, ServerRecord>,
    /// TSS records keyed by their own id.
    pub tss: BTreeMap<Uid, ServerRecord>,
    /// Live server id → its TSS id.
    pub tss_by_pair: BTreeMap<Uid, Uid>,
    pub machines: BTreeMap<MachineId, MachineRecord>,
    pub server_teams: BTreeMap<TeamId, ServerTeam>,
    pub machine_teams: BTreeMap<MachineTeamId, MachineTeam>,
    /// Process id → servers on that process, used by the wiggle sweep.
    pub pid_servers: BTreeMap<String, Vec<Uid>>,

    pub server_status: BTreeMap<Uid, ServerStatus>,
    pub unhealthy_servers: i64,
    pub healthy_team_count: i64,
    pub optimal_team_count: i64,
    pub priority_teams: BTreeMap<i32, i64>,

    pub excluded: BTreeMap<AddressExclusion, ExclusionStatus>,
    pub invalid_locality_addrs: BTreeSet<AddressExclusion>,
    pub wiggling_pid: Option<String>,
    pub wiggle_addresses: Vec<AddressExclusion>,

    pub recruiting_ids: BTreeSet<Uid>,
    pub recruiting_localities: BTreeSet<SocketAddr>,
    pub is_tss_recruiting: bool,
    /// Ids that have been removed; a stale server-list read must not bring
    /// them back. Ids are never reused across incarnations.
    pub removed_ids: BTreeSet<Uid>,

    pub do_build_teams: bool,
    pub last_build_teams_failed: bool,
    pub best_team_stuck_count: u64,

    pub median_available_space: f64,
    pub last_median_update: Option<Instant>,
    pub lowest_utilization_team: usize,
    pub highest_utilization_team: usize,

    pub zero_healthy_teams_tx: watch::Sender<bool>,
    pub zero_optimal_teams_tx: watch::Sender<bool>,

    next_team_id: u64,
    next_machine_team_id: u64,
}

impl CollectionState {
    pub fn new(cfg: &TeamCollectionConfig) -> Self {
        CollectionState {
            servers: BTreeMap::new(),
            tss: BTreeMap::new(),
            tss_by_pair: BTreeMap::new(),
            machines: BTreeMap::new(),
            server_teams: BTreeMap::new(),
            machine_teams: BTreeMap::new(),
            pid_servers: BTreeMap::new(),
            server_status: BTreeMap::new(),
            unhealthy_servers: 0,
            healthy_team_count: 0,
            optimal_team_count: 0,
            priority_teams: BTreeMap::new(),
            excluded: BTreeMap::new(),
            invalid_locality_addrs: BTreeSet::new(),
            wiggling_pid: None,
            wiggle_addresses: Vec::new(),
            recruiting_ids: BTreeSet::new(),
            recruiting_localities: BTreeSet::new(),
            is_tss_recruiting: false,
            removed_ids: BTreeSet::new(),
            do_build_teams: false,
            last_build_teams_failed: false,
            best_team_stuck_count: 0,
            median_available_space: cfg.min_available_space_ratio,
            last_median_update: None,
            lowest_utilization_team: 0,
            highest_utilization_team: 0,
            zero_healthy_teams_tx: watch::channel(true).0,
            zero_optimal_teams_tx: watch::channel(true).0,
            next_team_id: 1,
            next_machine_team_id: 1,
        }
    }

    // ---- server registry ----------------------------------------------

    /// Register a server (or TSS) and attach it to its machine.
    pub fn add_server(&mut self, entry: ServerListEntry) -> Uid {
        let id = entry.id;
        let is_tss = entry.is_tss();
        let mut record = ServerRecord::from_entry(entry);

        if is_tss {
            if let Some(pair) = record.tss_pair_of {
                self.tss_by_pair.insert(pair, id);
            }
            self.tss.insert(id, record);
        } else {
            if let Some(pid) = record.locality.process_id() {
                self.pid_servers.entry(pid.to_string()).or_default().push(id);
            }
            let machine = self.check_and_create_machine(id, &record.locality);
            record.machine = Some(machine);
            self.servers.insert(id, record);
        }
        // Status starts uninitialized; the tracker's first pass fills it in.
        id
    }

    /// Drop a server record plus every team and (possibly) machine that
    /// depended on it. Returns the cancellation tokens of removed team
    /// trackers so the caller can cancel them outside the lock.
    pub fn remove_server(&mut self, id: Uid) -> Vec<CancellationToken> {
        let mut cancelled = Vec::new();
        self.removed_ids.insert(id);
        if let Some(tss) = self.tss.remove(&id) {
            if let Some(pair) = tss.tss_pair_of {
                self.tss_by_pair.remove(&pair);
            }
            self.server_status.remove(&id);
            let _ = tss.removed_tx.send(true);
            return cancelled;
        }

        let Some(record) = self.servers.remove(&id) else {
            return cancelled;
        };
        if let Some(status) = self.server_status.remove(&id) {
            if status.is_unhealthy() {
                self.unhealthy_servers -= 1;
            }
        }

        for team_id in record.teams.clone() {
            if let Some(team) = self.remove_team_inner(team_id, Some(id)) {
                cancelled.push(team.cancel);
            }
        }

        if let Some(pid) = record.locality.process_id() {
            if let Some(list) = self.pid_servers.get_mut(pid) {
                list.retain(|s| *s != id);
                if list.is_empty() {
                    self.pid_servers.remove(pid);
                }
            }
        }

        if let Some(machine_id) = record.machine.clone() {
            self.detach_server_from_machine(&machine_id, id);
        }

        if let Some(tss_id) = self.tss_by_pair.get(&id).copied() {
            // Pair removal is driven by the TSS tracker; just wake it.
            if let Some(tss) = self.tss.get(&tss_id) {
                tss.wake.notify_one();
            }
        }

        let _ = record.removed_tx.send(true);
        cancelled
    }

    /// Record a tracker-computed status and keep `unhealthy_servers` exact.
    /// Ignored for servers no longer in the registries.
    pub fn set_server_status(&mut self, id: Uid, status: ServerStatus) {
        let is_tss = self.tss.contains_key(&id);
        if !is_tss && !self.servers.contains_key(&id) {
            return;
        }
        let previous = self.server_status.insert(id, status);
        if !is_tss {
            let was = previous.map_or(false, |s| s.is_unhealthy());
            let now = status.is_unhealthy();
            if was != now {
                self.unhealthy_servers += if now { 1 } else { -1 };
            }
        }
        let record = if is_tss { self.tss.get(&id) } else { self.servers.get(&id) };
        if let Some(record) = record {
            let _ = record.status_tx.send(status);
        }
    }

    pub fn status(&self, id: Uid) -> ServerStatus {
        // Uninitialized servers read as failed so they never join teams
        // before their tracker has run.
        self.server_status
            .get(&id)
            .copied()
            .unwrap_or(ServerStatus { failed: true, ..Default::default() })
    }

    pub fn status_initialized(&self, id: Uid) -> bool {
        self.server_status.contains_key(&id)
    }

    pub fn server_or_tss(&self, id: Uid) -> Option<&ServerRecord> {
        self.servers.get(&id).or_else(|| self.tss.get(&id))
    }

    pub fn servers_and_tss(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values().chain(self.tss.values())
    }

    // ---- machine registry ---------------------------------------------

    /// Ensure a machine exists for the server's zone and record membership.
    pub fn check_and_create_machine(&mut self, server: Uid, locality: &Locality) -> MachineId {
        let zone = locality.zone_id().unwrap_or("").to_string();
        let machine = self.machines.entry(zone.clone()).or_insert_with(|| MachineRecord {
            id: zone.clone(),
            servers: Vec::new(),
            machine_teams: Vec::new(),
        });
        if !machine.servers.contains(&server) {
            machine.servers.push(server);
        }
        zone
    }

    /// Remove one server from a machine, dropping the machine and its
    /// machine teams when it empties.
    pub fn detach_server_from_machine(&mut self, machine_id: &str, server: Uid) {
        let Some(machine) = self.machines.get_mut(machine_id) else {
            return;
        };
        machine.servers.retain(|s| *s != server);
        if machine.servers.is_empty() {
            let machine = self.machines.remove(machine_id).expect("machine present");
            for mt_id in machine.machine_teams {
                // Any server team on this machine team had a member on the
                // emptied machine, so it is already gone.
                self.remove_machine_team(mt_id);
            }
        }
    }

    /// A machine is healthy iff it is registered and has at least one
    /// non-unhealthy server.
    pub fn is_machine_healthy(&self, machine_id: &str) -> bool {
        let Some(machine) = self.machines.get(machine_id) else {
            return false;
        };
        machine.servers.iter().any(|s| !self.status(*s).is_unhealthy())
    }

    pub fn is_machine_team_healthy(&self, team: &MachineTeam, team_size: usize) -> bool {
        team.machines.len() == team_size
            && team.machines.iter().all(|m| self.is_machine_healthy(m))
    }

    pub fn healthy_server_count(&self) -> usize {
        self.servers
            .keys()
            .filter(|id| !self.status(**id).is_unhealthy())
            .count()
    }

    pub fn healthy_machine_count(&self) -> usize {
        self.machines
            .keys()
            .filter(|id| self.is_machine_healthy(id))
            .count()
    }

    pub fn healthy_machine_team_count(&self, team_size: usize) -> usize {
        self.machine_teams
            .values()
            .filter(|mt| self.is_machine_team_healthy(mt, team_size))
            .count()
    }

    // ---- machine teams ------------------------------------------------

    /// Find or create the machine team with exactly these machines.
    pub fn find_or_create_machine_team(&mut self, mut machines: Vec<MachineId>) -> MachineTeamId {
        machines.sort();
        machines.dedup();
        if let Some(existing) = self
            .machine_teams
            .values()
            .find(|mt| mt.machines == machines)
        {
            return existing.id;
        }
        let id = MachineTeamId(self.next_machine_team_id);
        self.next_machine_team_id += 1;
        for m in &machines {
            if let Some(machine) = self.machines.get_mut(m) {
                machine.machine_teams.push(id);
            }
        }
        self.machine_teams.insert(
            id,
            MachineTeam { id, machines, server_teams: Vec::new() },
        );
        id
    }

    pub fn remove_machine_team(&mut self, id: MachineTeamId) -> bool {
        let Some(team) = self.machine_teams.remove(&id) else {
            return false;
        };
        for m in &team.machines {
            if let Some(machine) = self.machines.get_mut(m) {
                machine.machine_teams.retain(|mt| *mt != id);
            }
        }
        for st in &team.server_teams {
            if let Some(server_team) = self.server_teams.get_mut(st) {
                server_team.machine_team = None;
            }
        }
        true
    }

    // ---- server teams -------------------------------------------------

    /// Add a server team. Returns `None` when a team with the same member
    /// set already exists. Good teams get their machine team linked; bad
    /// teams (wrong size or policy) are only tracked for removal.
    pub fn add_team(&mut self, mut servers: Vec<Uid>, bad: bool, redundant: bool) -> Option<TeamId> {
        servers.sort();
        servers.dedup();
        // A bad team with the same member set may linger while it drains; it
        // does not block a fresh good team, and vice versa.
        if self
            .server_teams
            .values()
            .any(|t| t.bad == bad && t.servers == servers)
        {
            return None;
        }

        let machine_team = if bad {
            None
        } else {
            let machines: Vec<MachineId> = servers
                .iter()
                .filter_map(|s| self.servers.get(s).and_then(|r| r.machine.clone()))
                .collect();
            if machines.len() != servers.len() {
                return None;
            }
            Some(self.find_or_create_machine_team(machines))
        };

        let id = TeamId(self.next_team_id);
        self.next_team_id += 1;

        for s in &servers {
            if let Some(record) = self.servers.get_mut(s) {
                record.teams.push(id);
            }
        }
        if let Some(mt) = machine_team {
            if let Some(machine_team) = self.machine_teams.get_mut(&mt) {
                machine_team.server_teams.push(id);
            }
        }

        self.server_teams.insert(
            id,
            ServerTeam {
                id,
                servers,
                machine_team,
                healthy: false,
                optimal: false,
                wrong_configuration: false,
                priority: priority::TEAM_HEALTHY,
                bad,
                redundant,
                tracker_started: false,
                cancel: CancellationToken::new(),
            },
        );
        *self.priority_teams.entry(priority::TEAM_HEALTHY).or_default() += 1;
        Some(id)
    }

    /// Remove a team and detach it everywhere; counters are settled here so
    /// tracker cancellation has no bookkeeping left to do.
    pub fn remove_team(&mut self, id: TeamId) -> Option<ServerTeam> {
        self.remove_team_inner(id, None)
    }

    fn remove_team_inner(&mut self, id: TeamId, skip_server: Option<Uid>) -> Option<ServerTeam> {
        let team = self.server_teams.remove(&id)?;
        for s in &team.servers {
            if Some(*s) == skip_server {
                continue;
            }
            if let Some(record) = self.servers.get_mut(s) {
                record.teams.retain(|t| *t != id);
            }
        }
        if let Some(mt) = team.machine_team {
            if let Some(machine_team) = self.machine_teams.get_mut(&mt) {
                machine_team.server_teams.retain(|t| *t != id);
            }
        }
        if team.healthy {
            self.note_healthy_delta(-1);
        }
        if team.optimal {
            self.note_optimal_delta(-1);
        }
        if let Some(count) = self.priority_teams.get_mut(&team.priority) {
            *count -= 1;
        }
        team.cancel.cancel();
        Some(team)
    }

    /// Teams that count: everything not flagged bad.
    pub fn good_teams(&self) -> impl Iterator<Item = &ServerTeam> {
        self.server_teams.values().filter(|t| !t.bad)
    }

    pub fn bad_teams(&self) -> impl Iterator<Item = &ServerTeam> {
        self.server_teams.values().filter(|t| t.bad)
    }

    /// Apply a tracker's health/optimal verdict, maintaining the counters
    /// and the zero-team flags.
    pub fn set_team_health(&mut self, id: TeamId, healthy: bool, optimal: bool) {
        let Some(team) = self.server_teams.get_mut(&id) else {
            return;
        };
        let was_healthy = team.healthy;
        let was_optimal = team.optimal;
        team.healthy = healthy;
        team.optimal = optimal;
        if was_healthy != healthy {
            self.note_healthy_delta(if healthy { 1 } else { -1 });
        }
        if was_optimal != optimal {
            self.note_optimal_delta(if optimal { 1 } else { -1 });
        }
    }

    fn note_healthy_delta(&mut self, delta: i64) {
        self.healthy_team_count += delta;
        debug_assert!(self.healthy_team_count >= 0);
        let _ = self.zero_healthy_teams_tx.send(self.healthy_team_count == 0);
    }

    fn note_optimal_delta(&mut self, delta: i64) {
        self.optimal_team_count += delta;
        debug_assert!(self.optimal_team_count >= 0);
        let _ = self.zero_optimal_teams_tx.send(self.optimal_team_count == 0);
    }

    pub fn set_team_priority(&mut self, id: TeamId, new_priority: i32) {
        let Some(team) = self.server_teams.get_mut(&id) else {
            return;
        };
        let old = team.priority;
        if old == new_priority {
            return;
        }
        team.priority = new_priority;
        if let Some(count) = self.priority_teams.get_mut(&old) {
            *count -= 1;
        }
        *self.priority_teams.entry(new_priority).or_default() += 1;
    }

    // ---- policy helpers -----------------------------------------------

    pub fn satisfies_policy(
        &self,
        policy: &crate::policy::ReplicationPolicy,
        servers: &[Uid],
    ) -> bool {
        let locs: Vec<&Locality> = servers
            .iter()
            .filter_map(|s| self.servers.get(s).map(|r| &r.locality))
            .collect();
        locs.len() == servers.len() && policy.satisfies(&locs)
    }

    /// Largest member overlap between `sorted` and any good server team,
    /// via a two-pointer merge over the sorted id lists.
    pub fn overlapping_members(&self, sorted: &[Uid]) -> usize {
        self.good_teams()
            .map(|t| sorted_overlap(&t.servers, sorted))
            .max()
            .unwrap_or(0)
    }

    /// Same, for machine teams over sorted machine id lists.
    pub fn overlapping_machine_members(&self, sorted: &[MachineId]) -> usize {
        self.machine_teams
            .values()
            .map(|t| sorted_overlap_str(&t.machines, sorted))
            .max()
            .unwrap_or(0)
    }

    // ---- exclusion map ------------------------------------------------

    /// Worst exclusion status across all of a server's addresses.
    pub fn worst_exclusion(&self, record: &ServerRecord) -> (ExclusionStatus, Option<AddressExclusion>) {
        let mut worst = (ExclusionStatus::None, None);
        for addr in record.exclusion_addresses() {
            let status = self
                .excluded
                .get(&addr)
                .copied()
                .unwrap_or(ExclusionStatus::None);
            if status > worst.0 {
                worst = (status, Some(addr));
            }
        }
        worst
    }

    /// True when any exclusion of at least `FAILED` severity covers one of
    /// the team's members.
    pub fn team_contains_failed_server(&self, team: &ServerTeam) -> bool {
        team.servers.iter().any(|s| {
            self.servers
                .get(s)
                .map_or(false, |r| self.worst_exclusion(r).0 == ExclusionStatus::Failed)
        })
    }

    // ---- diagnostics / sanity -----------------------------------------

    /// Verify the cross-registry invariants; used by tests after every
    /// settling point and by debug assertions.
    pub fn check_invariants(&self, cfg: &TeamCollectionConfig) -> std::result::Result<(), String> {
        for (id, team) in &self.server_teams {
            if !team.bad && team.servers.len() != cfg.team_size {
                return Err(format!("{id:?} has size {}", team.servers.len()));
            }
            for s in &team.servers {
                if !team.bad && !self.servers.contains_key(s) {
                    return Err(format!("{id:?} references unknown server {s}"));
                }
                if let Some(record) = self.servers.get(s) {
                    if !record.teams.contains(id) {
                        return Err(format!("{s} missing membership of {id:?}"));
                    }
                }
            }
            if !team.bad {
                let mut machines: Vec<MachineId> = team
                    .servers
                    .iter()
                    .filter_map(|s| self.servers.get(s).and_then(|r| r.machine.clone()))
                    .collect();
                machines.sort();
                let mt = team
                    .machine_team
                    .and_then(|mt| self.machine_teams.get(&mt))
                    .ok_or_else(|| format!("{id:?} has no machine team"))?;
                if mt.machines != machines {
                    return Err(format!("{id:?} machine projection mismatch"));
                }
                if !self.satisfies_policy(&cfg.policy, &team.servers) {
                    return Err(format!("{id:?} violates the replication policy"));
                }
            }
        }
        for (id, record) in &self.servers {
            for t in &record.teams {
                let team = self
                    .server_teams
                    .get(t)
                    .ok_or_else(|| format!("{id} references dead {t:?}"))?;
                if !team.servers.contains(id) {
                    return Err(format!("{t:?} does not contain {id}"));
                }
            }
            let machine = record
                .machine
                .as_ref()
                .and_then(|m| self.machines.get(m))
                .ok_or_else(|| format!("{id} has no machine"))?;
            if !machine.servers.contains(id) {
                return Err(format!("{id} not on its machine {}", machine.id));
            }
            if record.locality.zone_id() != Some(machine.id.as_str()) {
                return Err(format!("{id} zone does not match machine {}", machine.id));
            }
        }
        for (id, machine) in &self.machines {
            if machine.servers.is_empty() {
                return Err(format!("machine {id} is empty"));
            }
        }
        let healthy = self.good_teams().filter(|t| t.healthy).count() as i64;
        if healthy != self.healthy_team_count {
            return Err(format!(
                "healthy_team_count {} != {}",
                self.healthy_team_count, healthy
            ));
        }
        if *self.zero_healthy_teams_tx.borrow() != (self.healthy_team_count == 0) {
            return Err("zero_healthy_teams flag out of sync".to_string());
        }
        let unhealthy = self
            .servers
            .keys()
            .filter(|id| self.status_initialized(**id) && self.status(**id).is_unhealthy())
            .count() as i64;
        if unhealthy != self.unhealthy_servers {
            return Err(format!(
                "unhealthy_servers {} != {}",
                self.unhealthy_servers, unhealthy
            ));
        }
        Ok(())
    }

    /// Every server team's machine projection must be a machine team.
    pub fn sanity_check_teams(&self) -> bool {
        self.good_teams().all(|team| {
            let mut machines: Vec<MachineId> = team
                .servers
                .iter()
                .filter_map(|s| self.servers.get(s).and_then(|r| r.machine.clone()))
                .collect();
            machines.sort();
            team.machine_team
                .and_then(|mt| self.machine_teams.get(&mt))
                .map_or(false, |mt| mt.machines == machines)
        })
    }

    pub fn min_max_teams_per_server(&self) -> (usize, usize) {
        let mut min = usize::MAX;
        let mut max = 0;
        for (id, record) in &self.servers {
            if self.status(*id).is_unhealthy() {
                continue;
            }
            min = min.min(record.teams.len());
            max = max.max(record.teams.len());
        }
        if min == usize::MAX {
            min = 0;
        }
        (min, max)
    }
}

fn sorted_overlap(a: &[Uid], b: &[Uid]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

fn sorted_overlap_str(a: &[MachineId], b: &[MachineId]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::external::ServerListEntry;
    use crate::types::EngineType;

    /// Register a healthy server on the given zone for planner tests.
    pub fn seed_server(state: &mut CollectionState, n: u64, zone: &str) -> Uid {
        seed_server_on_process(state, n, zone, &format!("p{n}"))
    }

    pub fn seed_server_on_process(
        state: &mut CollectionState,
        n: u64,
        zone: &str,
        process: &str,
    ) -> Uid {
        let id = Uid(n, n);
        state.add_server(ServerListEntry {
            id,
            endpoint: format!("10.0.{}.1:4500", n).parse().unwrap(),
            secondary_endpoint: None,
            locality: Locality::new("dc1", "hallA", zone, process),
            process_class: ProcessClass::Storage,
            engine: EngineType::LsmTree,
            added_version: 100,
            tss_pair_of: None,
        });
        state.set_server_status(id, ServerStatus::default());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::seed_server;
    use super::*;
    use crate::config::TeamCollectionConfig;

    fn triple_state() -> (TeamCollectionConfig, CollectionState, Vec<Uid>) {
        let cfg = TeamCollectionConfig::triple();
        let mut state = CollectionState::new(&cfg);
        let ids: Vec<Uid> = (0..6)
            .map(|n| seed_server(&mut state, n, &format!("z{n}")))
            .collect();
        (cfg, state, ids)
    }

    #[test]
    fn add_team_links_servers_and_machine_team() {
        let (cfg, mut state, ids) = triple_state();
        let team = state
            .add_team(vec![ids[0], ids[1], ids[2]], false, false)
            .expect("new team");
        assert!(state.sanity_check_teams());
        assert!(state.servers[&ids[0]].teams.contains(&team));
        assert_eq!(state.machine_teams.len(), 1);
        state.check_invariants(&cfg).unwrap();
    }

    #[test]
    fn duplicate_member_set_is_rejected() {
        let (_cfg, mut state, ids) = triple_state();
        assert!(state.add_team(vec![ids[0], ids[1], ids[2]], false, false).is_some());
        // Order must not matter.
        assert!(state.add_team(vec![ids[2], ids[0], ids[1]], false, false).is_none());
    }

    #[test]
    fn remove_team_detaches_memberships_and_counters() {
        let (cfg, mut state, ids) = triple_state();
        let team = state.add_team(vec![ids[0], ids[1], ids[2]], false, false).unwrap();
        state.set_team_health(team, true, true);
        assert_eq!(state.healthy_team_count, 1);
        assert!(!*state.zero_healthy_teams_tx.borrow());

        state.remove_team(team).expect("team existed");
        assert_eq!(state.healthy_team_count, 0);
        assert!(*state.zero_healthy_teams_tx.borrow());
        assert!(state.servers[&ids[0]].teams.is_empty());
        state.check_invariants(&cfg).unwrap();
    }

    #[test]
    fn removing_last_server_drops_machine_and_machine_teams() {
        let (cfg, mut state, ids) = triple_state();
        state.add_team(vec![ids[0], ids[1], ids[2]], false, false).unwrap();
        state.remove_server(ids[0]);
        assert!(!state.machines.contains_key("z0"));
        assert!(state.machine_teams.is_empty());
        assert!(state.server_teams.is_empty());
        state.check_invariants(&cfg).unwrap();
    }

    #[test]
    fn unhealthy_server_counter_tracks_status_changes() {
        let (_cfg, mut state, ids) = triple_state();
        assert_eq!(state.unhealthy_servers, 0);
        state.set_server_status(ids[0], ServerStatus { failed: true, ..Default::default() });
        assert_eq!(state.unhealthy_servers, 1);
        state.set_server_status(ids[0], ServerStatus::default());
        assert_eq!(state.unhealthy_servers, 0);
    }

    #[test]
    fn overlap_uses_two_pointer_merge() {
        let (_cfg, mut state, ids) = triple_state();
        state.add_team(vec![ids[0], ids[1], ids[2]], false, false).unwrap();
        let mut probe = vec![ids[1], ids[2], ids[3]];
        probe.sort();
        assert_eq!(state.overlapping_members(&probe), 2);
        let mut same = vec![ids[0], ids[1], ids[2]];
        same.sort();
        assert_eq!(state.overlapping_members(&same), 3);
    }

    #[test]
    fn worst_exclusion_takes_ip_match_into_account() {
        let (_cfg, mut state, ids) = triple_state();
        let record_ip = state.servers[&ids[0]].endpoint.ip();
        state
            .excluded
            .insert(AddressExclusion::ip_only(record_ip), ExclusionStatus::Failed);
        let record = state.servers.get(&ids[0]).unwrap();
        assert_eq!(state.worst_exclusion(record).0, ExclusionStatus::Failed);
    }

    #[test]
    fn machine_health_requires_a_non_unhealthy_server() {
        let (_cfg, mut state, ids) = triple_state();
        assert!(state.is_machine_healthy("z0"));
        state.set_server_status(ids[0], ServerStatus { failed: true, ..Default::default() });
        assert!(!state.is_machine_healthy("z0"));
        assert!(!state.is_machine_healthy("nonexistent"));
    }
}
