//! The team collection handle and its housekeeping tasks.
//!
//! `TeamCollection` owns the [`CollectionState`] behind a lock, the seeded
//! RNG, the collaborator handles, and the signal channels the background
//! tasks coordinate through. Two symmetric instances run per process (one
//! per region); each holds a weak reference to its sibling for cross-region
//! priority comparison.
//!
//! Critical sections never hold the state lock across an await; tasks take
//! the lock, mutate, drop, then wait on their channels.

use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TeamCollectionConfig;
use crate::error::DdError;
use crate::external::{
    FailureMonitor, HealthyZone, MetaStore, ServerListEntry, ShardMap, WorkerPool,
    HEALTHY_ZONE_KEY,
};
use crate::selection::{self, GetTeamRequest, TeamSelection};
use crate::state::{CollectionState, TeamId};
use crate::types::{ExclusionStatus, RelocateShard, Region, Uid};

/// Handles to everything outside the collection.
#[derive(Clone)]
pub struct Collaborators {
    pub meta: Arc<dyn MetaStore>,
    pub workers: Arc<dyn WorkerPool>,
    pub failure_monitor: Arc<dyn FailureMonitor>,
    pub shard_map: Arc<dyn ShardMap>,
}

pub struct TeamCollection {
    pub cfg: TeamCollectionConfig,
    pub region: Region,
    pub deps: Collaborators,

    state: RwLock<CollectionState>,
    rng: StdMutex<SmallRng>,

    /// Relocation requests consumed by the external move queue.
    relocations: mpsc::UnboundedSender<RelocateShard>,
    /// Servers under a FAILED exclusion, handed to the external removal path.
    failed_servers: mpsc::UnboundedSender<Uid>,
    /// First unrecoverable task error; tearing down the collection.
    fatal_tx: watch::Sender<Option<DdError>>,

    /// Wakes the team builder; `do_build_teams` carries the request bit.
    pub build_requested: Notify,
    /// Wakes the recruiter to re-issue its candidate request.
    pub restart_recruiting: Notify,
    /// Bumped when the exclusion map changes.
    pub exclusion_epoch: watch::Sender<u64>,
    pub healthy_zone: watch::Sender<Option<HealthyZone>>,
    pub pause_wiggle: watch::Sender<bool>,
    /// False during the initial failure-reaction grace period.
    pub failure_delay_ready: watch::Sender<bool>,
    /// Set once the bootstrap add-subset pass has finished.
    pub add_subset_complete: watch::Sender<bool>,

    peer: RwLock<Weak<TeamCollection>>,

    /// Cancelled first at teardown so no new teams appear mid-shutdown.
    pub builder_cancel: CancellationToken,
    /// Root token for everything else.
    pub cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TeamCollection {
    pub fn new(
        cfg: TeamCollectionConfig,
        region: Region,
        deps: Collaborators,
        relocations: mpsc::UnboundedSender<RelocateShard>,
        failed_servers: mpsc::UnboundedSender<Uid>,
    ) -> Arc<Self> {
        let state = CollectionState::new(&cfg);
        let rng = SmallRng::seed_from_u64(cfg.rng_seed);
        Arc::new(TeamCollection {
            cfg,
            region,
            deps,
            state: RwLock::new(state),
            rng: StdMutex::new(rng),
            relocations,
            failed_servers,
            fatal_tx: watch::channel(None).0,
            build_requested: Notify::new(),
            restart_recruiting: Notify::new(),
            exclusion_epoch: watch::channel(0).0,
            healthy_zone: watch::channel(None).0,
            pause_wiggle: watch::channel(true).0,
            failure_delay_ready: watch::channel(false).0,
            add_subset_complete: watch::channel(false).0,
            peer: RwLock::new(Weak::new()),
            builder_cancel: CancellationToken::new(),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    // ---- plumbing -----------------------------------------------------

    pub fn read(&self) -> RwLockReadGuard<'_, CollectionState> {
        self.state.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, CollectionState> {
        self.state.write().unwrap()
    }

    pub fn with_rng<T>(&self, f: impl FnOnce(&mut SmallRng) -> T) -> T {
        f(&mut self.rng.lock().unwrap())
    }

    pub fn set_peer(self: &Arc<Self>, peer: &Arc<TeamCollection>) {
        *self.peer.write().unwrap() = Arc::downgrade(peer);
    }

    pub fn peer(&self) -> Option<Arc<TeamCollection>> {
        self.peer.read().unwrap().upgrade()
    }

    pub fn zero_healthy_teams(&self) -> watch::Receiver<bool> {
        self.read().zero_healthy_teams_tx.subscribe()
    }

    pub fn zero_optimal_teams(&self) -> watch::Receiver<bool> {
        self.read().zero_optimal_teams_tx.subscribe()
    }

    pub fn send_relocation(&self, relocate: RelocateShard) {
        tracing::debug!(
            region = ?self.region,
            keys = ?relocate.keys,
            priority = relocate.priority,
            "sending relocation to move queue"
        );
        let _ = self.relocations.send(relocate);
    }

    pub fn report_failed_server(&self, id: Uid) {
        let _ = self.failed_servers.send(id);
    }

    /// Record the first unrecoverable error and start teardown.
    pub fn report_fatal(&self, err: DdError) {
        if err == DdError::Cancelled {
            return;
        }
        let mut first = false;
        self.fatal_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err.clone());
                first = true;
                true
            } else {
                false
            }
        });
        if first {
            tracing::warn!(region = ?self.region, error = %err, "team collection failing");
            self.cancel.cancel();
        }
    }

    pub fn fatal_error(&self) -> Option<DdError> {
        self.fatal_tx.borrow().clone()
    }

    /// Flag a build as wanted and wake the builder.
    pub fn request_build(&self) {
        self.write().do_build_teams = true;
        self.build_requested.notify_one();
    }

    // ---- team / server registration -----------------------------------

    /// Register a server record and start its tracker tasks.
    pub fn register_server(self: &Arc<Self>, entry: ServerListEntry) {
        let is_tss = entry.is_tss();
        let id = entry.id;
        {
            let mut state = self.write();
            if state.server_or_tss(id).is_some() || state.removed_ids.contains(&id) {
                tracing::debug!(server = %id, "ignoring duplicate or removed server registration");
                return;
            }
            state.add_server(entry);
        }
        let tc = Arc::clone(self);
        self.spawn(async move {
            crate::server_tracker::run(tc, id, is_tss).await;
        });
        let tc = Arc::clone(self);
        self.spawn(async move {
            crate::server_tracker::metrics_polling(tc, id).await;
        });
        if !is_tss {
            self.request_build();
        }
    }

    /// Add a team to the registries and start its tracker.
    pub fn register_team(self: &Arc<Self>, servers: Vec<Uid>, bad: bool, redundant: bool) -> Option<TeamId> {
        let team_id = self.write().add_team(servers, bad, redundant)?;
        self.start_team_tracker(team_id, bad, redundant);
        Some(team_id)
    }

    /// Start the tracker for a team already present in the registries.
    pub fn start_team_tracker(self: &Arc<Self>, team_id: TeamId, bad: bool, redundant: bool) {
        {
            let mut state = self.write();
            match state.server_teams.get_mut(&team_id) {
                Some(team) if !team.tracker_started => team.tracker_started = true,
                _ => return,
            }
        }
        let tc = Arc::clone(self);
        self.spawn(async move {
            crate::team_tracker::run(tc, team_id, bad, redundant).await;
        });
    }

    /// Apply an interface change reported by the server-list watcher:
    /// update the record, move it across machines on a zone change, and
    /// convert teams the move invalidated into bad teams.
    pub fn on_interface_changed(self: &Arc<Self>, entry: ServerListEntry) {
        let mut invalidated: Vec<Vec<Uid>> = Vec::new();
        {
            let mut state = self.write();
            let Some(record) = state.servers.get(&entry.id) else {
                return;
            };
            let locality_changed = record.locality != entry.locality;
            let zone_changed = record.locality.zone_id() != entry.locality.zone_id();
            let process_changed = record.locality.process_id() != entry.locality.process_id();
            let old_locality = record.locality.clone();
            let old_machine = record.machine.clone();

            {
                let record = state.servers.get_mut(&entry.id).unwrap();
                record.endpoint = entry.endpoint;
                record.secondary_endpoint = entry.secondary_endpoint;
                record.locality = entry.locality.clone();
                record.process_class = entry.process_class;
            }

            if locality_changed {
                tracing::info!(
                    server = %entry.id,
                    zone_changed,
                    process_changed,
                    "storage server locality changed"
                );
                if zone_changed {
                    if let Some(machine_id) = old_machine {
                        state.detach_server_from_machine(&machine_id, entry.id);
                    }
                    let machine = state.check_and_create_machine(entry.id, &entry.locality);
                    state.servers.get_mut(&entry.id).unwrap().machine = Some(machine);
                }
                if process_changed {
                    if let Some(old_pid) = old_locality.process_id() {
                        if let Some(list) = state.pid_servers.get_mut(old_pid) {
                            list.retain(|s| *s != entry.id);
                            if list.is_empty() {
                                state.pid_servers.remove(old_pid);
                            }
                        }
                    }
                    if let Some(new_pid) = entry.locality.process_id() {
                        state
                            .pid_servers
                            .entry(new_pid.to_string())
                            .or_default()
                            .push(entry.id);
                    }
                }

                // Teams that no longer satisfy the policy, or whose machine
                // projection changed, are rebuilt as bad teams pending
                // removal.
                let team_ids = state.servers[&entry.id].teams.clone();
                for team_id in team_ids {
                    let Some(team) = state.server_teams.get(&team_id) else {
                        continue;
                    };
                    if team.bad {
                        continue;
                    }
                    let servers = team.servers.clone();
                    if !state.satisfies_policy(&self.cfg.policy, &servers) {
                        state.remove_team(team_id);
                        invalidated.push(servers);
                    } else if zone_changed {
                        let machines: Vec<String> = servers
                            .iter()
                            .filter_map(|s| state.servers.get(s).and_then(|r| r.machine.clone()))
                            .collect();
                        let machine_team = state.find_or_create_machine_team(machines);
                        let old = state
                            .server_teams
                            .get(&team_id)
                            .and_then(|t| t.machine_team);
                        if old != Some(machine_team) {
                            if let Some(old_id) = old {
                                if let Some(mt) = state.machine_teams.get_mut(&old_id) {
                                    mt.server_teams.retain(|t| *t != team_id);
                                }
                            }
                            if let Some(team) = state.server_teams.get_mut(&team_id) {
                                team.machine_team = Some(machine_team);
                            }
                            if let Some(mt) = state.machine_teams.get_mut(&machine_team) {
                                mt.server_teams.push(team_id);
                            }
                        }
                    }
                }
            }
        }

        for servers in invalidated {
            self.register_team(servers, true, false);
        }
        if let Some(record) = self.read().servers.get(&entry.id) {
            record.wake.notify_one();
        }
        self.request_build();
        self.restart_recruiting.notify_one();
    }

    // ---- request surface ----------------------------------------------

    /// Pick the best team for a relocation; see the selection module for the
    /// metric.
    pub fn get_team(&self, req: &GetTeamRequest) -> TeamSelection {
        let mut state = self.write();
        self.with_rng(|rng| {
            selection::select_team(
                &mut state,
                &self.cfg,
                rng,
                self.deps.shard_map.as_ref(),
                self.region.is_primary(),
                Instant::now(),
                req,
            )
        })
    }

    /// Move-queue hook: account bytes in flight toward each member of a
    /// team (negative once the move lands).
    pub fn add_data_in_flight(&self, servers: &[Uid], delta: i64) {
        let mut state = self.write();
        for id in servers {
            if let Some(record) = state.servers.get_mut(id) {
                record.data_in_flight += delta;
            }
        }
    }

    /// Would excluding all of `ids` still leave every team a live member?
    pub fn exclusion_safety_check(&self, ids: &[Uid]) -> bool {
        let state = self.read();
        let safe = state
            .good_teams()
            .all(|team| team.servers.iter().any(|s| !ids.contains(s)));
        safe
    }

    /// Priority of the team with exactly these members, if it exists.
    pub fn team_priority_for(&self, servers: &[Uid]) -> Option<i32> {
        let state = self.read();
        let first = servers.first()?;
        let record = state.servers.get(first)?;
        for team_id in &record.teams {
            if let Some(team) = state.server_teams.get(team_id) {
                if team.servers == servers {
                    return Some(team.priority);
                }
            }
        }
        None
    }

    /// Wait until no server is unhealthy, then hold for `extra` to let the
    /// team trackers settle.
    pub async fn wait_until_healthy(&self, extra: std::time::Duration) {
        loop {
            let settled = {
                let state = self.read();
                state.unhealthy_servers == 0 && !state.servers.is_empty()
            };
            if settled {
                tokio::time::sleep(extra).await;
                let still = {
                    let state = self.read();
                    state.unhealthy_servers == 0
                };
                if still {
                    return;
                }
            }
            tokio::time::sleep(self.cfg.stall_check_delay).await;
        }
    }

    // ---- task management ----------------------------------------------

    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.tasks.lock().unwrap().push(handle);
    }

    /// Start every long-lived task. Called once after bootstrap seeding.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let tc = Arc::clone(self);
        self.spawn(async move { team_builder_loop(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { failure_reaction_timer(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { track_excluded_servers(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { healthy_zone_watcher(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { server_list_watcher(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { monitor_healthy_teams(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::recruiter::storage_recruiter(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::remover::bad_team_remover(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::remover::machine_team_remover(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::remover::server_team_remover(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::remover::wrong_engine_remover(tc).await });
        let tc = Arc::clone(self);
        self.spawn(async move { crate::wiggle::monitor_perpetual_wiggle(tc).await });
    }

    /// Tear the collection down in dependency order: builder first so no new
    /// teams appear, then team trackers, then server trackers, then the
    /// rest. The sibling back-pointer is dropped last.
    pub async fn shutdown(self: &Arc<Self>) {
        self.builder_cancel.cancel();
        {
            let state = self.read();
            for team in state.server_teams.values() {
                team.cancel.cancel();
            }
            for server in state.servers.values().chain(state.tss.values()) {
                server.cancel.cancel();
            }
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            // Tasks parked on collaborator RPCs have no cancellation point
            // of their own; abort is only observed at await points, so no
            // lock is ever poisoned.
            handle.abort();
            let _ = handle.await;
        }
        *self.peer.write().unwrap() = Weak::new();
        tracing::info!(region = ?self.region, "team collection torn down");
    }

    /// Diagnostic snapshot used by logs and tests.
    pub fn snapshot_info(&self) -> serde_json::Value {
        let state = self.read();
        serde_json::json!({
            "region": format!("{:?}", self.region),
            "servers": state.servers.len(),
            "tss": state.tss.len(),
            "machines": state.machines.len(),
            "server_teams": state.good_teams().count(),
            "bad_teams": state.bad_teams().count(),
            "machine_teams": state.machine_teams.len(),
            "healthy_teams": state.healthy_team_count,
            "optimal_teams": state.optimal_team_count,
            "unhealthy_servers": state.unhealthy_servers,
            "priorities": state
                .priority_teams
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(p, n)| (p.to_string(), *n))
                .collect::<std::collections::BTreeMap<String, i64>>(),
        })
    }

    /// Per-team and per-machine diagnostic records.
    pub fn detailed_info(&self) -> serde_json::Value {
        let state = self.read();
        let teams: Vec<serde_json::Value> = state
            .server_teams
            .values()
            .map(|t| {
                serde_json::json!({
                    "id": format!("{:?}", t.id),
                    "servers": t.servers.iter().map(|s| s.short()).collect::<Vec<_>>(),
                    "size": t.servers.len(),
                    "healthy": t.healthy,
                    "priority": t.priority,
                    "bad": t.bad,
                })
            })
            .collect();
        let machines: Vec<serde_json::Value> = state
            .machines
            .values()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "servers": m.servers.len(),
                    "machine_teams": m.machine_teams.len(),
                    "healthy": state.is_machine_healthy(&m.id),
                })
            })
            .collect();
        serde_json::json!({ "teams": teams, "machines": machines })
    }
}

/// Runs `build_teams` whenever a build is requested, rate-limited by the
/// stall check delay so bursts of requests coalesce.
async fn team_builder_loop(tc: Arc<TeamCollection>) {
    loop {
        tokio::select! {
            _ = tc.builder_cancel.cancelled() => return,
            _ = tc.build_requested.notified() => {}
        }
        tokio::time::sleep(tc.cfg.stall_check_delay).await;

        let wanted = {
            let mut state = tc.write();
            let wanted = state.do_build_teams;
            state.do_build_teams = false;
            wanted
        };
        if !wanted {
            continue;
        }

        let outcome = {
            let mut state = tc.write();
            tc.with_rng(|rng| crate::builder::build_teams(&mut state, &tc.cfg, rng))
        };
        // New teams need trackers; membership was already wired by add_team,
        // so find the ones without a started tracker via their tokens.
        let fresh: Vec<TeamId> = {
            let state = tc.read();
            state
                .good_teams()
                .filter(|t| !t.tracker_started)
                .map(|t| t.id)
                .collect()
        };
        for team_id in fresh {
            tc.start_team_tracker(team_id, false, false);
        }
        if outcome.added_teams > 0 {
            tracing::info!(
                region = ?tc.region,
                added_teams = outcome.added_teams,
                added_machine_teams = outcome.added_machine_teams,
                "built new teams"
            );
        }
    }
}

/// Sets `failure_delay_ready` after the initial grace period.
async fn failure_reaction_timer(tc: Arc<TeamCollection>) {
    tokio::select! {
        _ = tc.cancel.cancelled() => return,
        _ = tokio::time::sleep(tc.cfg.initial_failure_reaction_delay) => {}
    }
    let _ = tc.failure_delay_ready.send(true);
    tracing::debug!(region = ?tc.region, "initial failure reaction delay elapsed");
}

/// Mirrors the operator exclusion key ranges into the in-memory map.
async fn track_excluded_servers(tc: Arc<TeamCollection>) {
    let mut changes = tc.deps.meta.subscribe_exclusions();
    loop {
        let snapshot = match tc.deps.meta.read_exclusions().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read exclusion lists");
                tokio::time::sleep(tc.cfg.server_list_delay).await;
                continue;
            }
        };
        {
            let mut state = tc.write();
            // Drop stale operator exclusions; wiggle entries are owned by
            // the wiggler and left alone.
            let mut stale = Vec::new();
            for (addr, status) in &state.excluded {
                let operator_set =
                    matches!(status, ExclusionStatus::Excluded | ExclusionStatus::Failed);
                if operator_set
                    && !snapshot.excluded.contains(addr)
                    && !snapshot.failed.contains(addr)
                {
                    stale.push(*addr);
                }
            }
            for addr in stale {
                state.excluded.remove(&addr);
            }
            for addr in &snapshot.excluded {
                let entry = state.excluded.entry(*addr).or_insert(ExclusionStatus::None);
                if *entry < ExclusionStatus::Excluded {
                    *entry = ExclusionStatus::Excluded;
                }
            }
            for addr in &snapshot.failed {
                state.excluded.insert(*addr, ExclusionStatus::Failed);
            }
        }
        tc.exclusion_epoch.send_modify(|epoch| *epoch += 1);
        tc.restart_recruiting.notify_one();
        tracing::info!(
            region = ?tc.region,
            excluded = snapshot.excluded.len(),
            failed = snapshot.failed.len(),
            "exclusion lists updated"
        );

        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            result = changes.changed() => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

/// Follows the healthy-zone key; clears it once its deadline version passes.
async fn healthy_zone_watcher(tc: Arc<TeamCollection>) {
    let mut key_watch = tc.deps.meta.subscribe(HEALTHY_ZONE_KEY);
    loop {
        let current: Option<HealthyZone> = key_watch
            .borrow()
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        let mut expired = false;
        if let Some(zone) = &current {
            if !zone.ignores_all_failures() {
                if let Ok(version) = tc.deps.meta.read_version().await {
                    expired = version >= zone.end_version;
                }
            }
        }
        if expired {
            let _ = tc.deps.meta.set(HEALTHY_ZONE_KEY, "").await;
            let _ = tc.healthy_zone.send(None);
            tracing::info!(region = ?tc.region, "maintenance zone expired");
        } else {
            if *tc.healthy_zone.borrow() != current {
                tracing::info!(region = ?tc.region, zone = ?current, "healthy zone changed");
            }
            let _ = tc.healthy_zone.send(current);
        }

        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            result = key_watch.changed() => {
                if result.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(tc.cfg.server_list_delay * 10) => {}
        }
    }
}

/// Polls the server-list key range: registers new servers and applies
/// interface changes to known ones. Removal is tracker-driven, not list
/// driven.
async fn server_list_watcher(tc: Arc<TeamCollection>) {
    loop {
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tokio::time::sleep(tc.cfg.server_list_delay) => {}
        }
        let entries = match tc.deps.meta.server_list().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read server list");
                continue;
            }
        };
        for entry in entries {
            let known = {
                let state = tc.read();
                match state.server_or_tss(entry.id) {
                    None => None,
                    Some(record) => Some(
                        record.endpoint != entry.endpoint
                            || record.secondary_endpoint != entry.secondary_endpoint
                            || record.locality != entry.locality
                            || record.process_class != entry.process_class,
                    ),
                }
            };
            match known {
                None => tc.register_server(entry),
                Some(true) => tc.on_interface_changed(entry),
                Some(false) => {}
            }
        }
    }
}

/// While no healthy team exists, keep poking the builder.
async fn monitor_healthy_teams(tc: Arc<TeamCollection>) {
    let mut zero_healthy = tc.zero_healthy_teams();
    loop {
        if *zero_healthy.borrow() {
            tc.request_build();
            tokio::select! {
                _ = tc.cancel.cancelled() => return,
                _ = tokio::time::sleep(tc.cfg.stall_check_delay * 4) => {}
            }
        } else {
            tokio::select! {
                _ = tc.cancel.cancelled() => return,
                result = zero_healthy.changed() => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
