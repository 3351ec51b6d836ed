//! Team garbage collection.
//!
//! Three sweepers, each gated on a settled, healthy cluster:
//! - the bad-team remover drops teams flagged bad once the bootstrap
//!   add-subset pass has finished,
//! - the machine-team remover evicts over-represented machine teams while
//!   the total exceeds the desired count,
//! - the server-team remover does the same for server teams.
//!
//! Both cap-based removers target `(desired × (team_size + 1)) / 2` per
//! entity so a removal cannot immediately re-trigger the builder, and both
//! convert evicted server teams into redundant bad teams so their data
//! drains at `TEAM_REDUNDANT` priority before the records disappear.
//!
//! A fourth sweeper retires servers running the wrong storage engine: under
//! gradual migration only while the wiggle already covers them, under
//! aggressive migration outright.

use std::sync::Arc;

use crate::collection::TeamCollection;
use crate::config::MigrationMode;
use crate::state::{CollectionState, MachineTeamId, TeamId};
use crate::types::EngineType;

/// The machine team whose *least-teamed* member sits on the most machine
/// teams, provided that count exceeds the per-machine target.
pub fn machine_team_with_most_machine_teams(
    state: &CollectionState,
    target_per_machine: usize,
) -> Option<(MachineTeamId, usize)> {
    let mut found: Option<(MachineTeamId, usize)> = None;
    for mt in state.machine_teams.values() {
        let representative = mt
            .machines
            .iter()
            .filter_map(|m| state.machines.get(m).map(|m| m.machine_teams.len()))
            .min()
            .unwrap_or(0);
        if representative > target_per_machine
            && found.map_or(true, |(_, best)| representative > best)
        {
            found = Some((mt.id, representative));
        }
    }
    found
}

/// The machine team with the fewest server teams (legacy selection).
pub fn machine_team_with_least_server_teams(
    state: &CollectionState,
) -> Option<(MachineTeamId, usize)> {
    state
        .machine_teams
        .values()
        .map(|mt| (mt.id, mt.server_teams.len()))
        .min_by_key(|(_, n)| *n)
}

/// The server team whose least-teamed member sits on the most server teams,
/// provided that count exceeds the per-server target.
pub fn server_team_with_most_server_teams(
    state: &CollectionState,
    target_per_server: usize,
) -> Option<(TeamId, usize)> {
    let mut found: Option<(TeamId, usize)> = None;
    for team in state.good_teams() {
        let representative = team
            .servers
            .iter()
            .filter_map(|s| state.servers.get(s).map(|r| r.teams.len()))
            .min()
            .unwrap_or(0);
        if representative > target_per_server
            && found.map_or(true, |(_, best)| representative > best)
        {
            found = Some((team.id, representative));
        }
    }
    found
}

/// Drop bad teams once the add-subset bootstrap pass has completed and the
/// cluster has settled. Re-checks periodically because the other removers
/// keep minting new bad teams.
pub async fn bad_team_remover(tc: Arc<TeamCollection>) {
    let mut add_subset = tc.add_subset_complete.subscribe();
    let mut ready = tc.failure_delay_ready.subscribe();
    loop {
        if !*add_subset.borrow() {
            tokio::select! {
                _ = tc.cancel.cancelled() => return,
                result = add_subset.changed() => { if result.is_err() { return; } }
            }
            continue;
        }
        if !*ready.borrow() {
            tokio::select! {
                _ = tc.cancel.cancelled() => return,
                result = ready.changed() => { if result.is_err() { return; } }
            }
            continue;
        }
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tc.wait_until_healthy(tc.cfg.remove_team_extra_delay) => {}
        }

        let tokens = {
            let mut state = tc.write();
            let bad: Vec<TeamId> = state.bad_teams().map(|t| t.id).collect();
            let mut tokens = Vec::new();
            for id in bad {
                if let Some(team) = state.remove_team(id) {
                    tokens.push(team.cancel);
                }
            }
            tokens
        };
        let removed = tokens.len();
        for token in tokens {
            token.cancel();
        }
        if removed > 0 {
            tracing::info!(region = ?tc.region, removed, "removed bad teams");
        }

        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tokio::time::sleep(tc.cfg.remove_server_team_delay) => {}
        }
    }
}

pub async fn machine_team_remover(tc: Arc<TeamCollection>) {
    if tc.cfg.disable_machine_team_remover {
        return;
    }
    let mut removed_total = 0usize;
    loop {
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tokio::time::sleep(tc.cfg.remove_machine_team_delay) => {}
        }
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tc.wait_until_healthy(tc.cfg.remove_team_extra_delay) => {}
        }

        let converted = {
            let mut state = tc.write();
            let healthy_machines = state.healthy_machine_count();
            // Sweep only once every machine is back; a half-healthy registry
            // would evict teams the builder still needs.
            if healthy_machines != state.machines.len() {
                continue;
            }
            let desired_machine_teams = tc.cfg.desired_teams_per_server * healthy_machines;
            let total = state.machine_teams.len();
            let found = if tc.cfg.remove_team_with_most_teams {
                machine_team_with_most_machine_teams(&state, tc.cfg.target_teams_per_server())
            } else {
                machine_team_with_least_server_teams(&state)
            };

            let Some((mt_id, representative)) = found else {
                continue;
            };
            if total <= desired_machine_teams {
                if removed_total > 0 {
                    tracing::info!(
                        region = ?tc.region,
                        removed = removed_total,
                        machine_teams = total,
                        desired = desired_machine_teams,
                        "machine team remover settled"
                    );
                    removed_total = 0;
                }
                continue;
            }

            let server_teams = state.machine_teams[&mt_id].server_teams.clone();
            let mut converted = Vec::new();
            for st in server_teams {
                if let Some(team) = state.remove_team(st) {
                    team.cancel.cancel();
                    converted.push(team.servers);
                }
            }
            state.remove_machine_team(mt_id);
            removed_total += 1;
            tracing::info!(
                region = ?tc.region,
                machine_team = ?mt_id,
                teams_on_members = representative,
                machine_teams = total - 1,
                desired = desired_machine_teams,
                "removed over-represented machine team"
            );
            converted
        };

        for servers in converted {
            tc.register_team(servers, true, true);
        }
        tc.request_build();
    }
}

pub async fn server_team_remover(tc: Arc<TeamCollection>) {
    if tc.cfg.disable_server_team_remover {
        return;
    }
    let mut removed_total = 0usize;
    loop {
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tokio::time::sleep(tc.cfg.remove_server_team_delay) => {}
        }
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tc.wait_until_healthy(tc.cfg.remove_team_extra_delay) => {}
        }

        let converted = {
            let mut state = tc.write();
            let desired_server_teams = tc.cfg.desired_teams_per_server * state.servers.len();
            let total = state.good_teams().count();
            let found =
                server_team_with_most_server_teams(&state, tc.cfg.target_teams_per_server());

            let Some((team_id, representative)) = found else {
                continue;
            };
            if total <= desired_server_teams {
                if removed_total > 0 {
                    tracing::info!(
                        region = ?tc.region,
                        removed = removed_total,
                        server_teams = total,
                        desired = desired_server_teams,
                        "server team remover settled"
                    );
                    removed_total = 0;
                }
                continue;
            }

            let team = state.remove_team(team_id).expect("team id from scan");
            team.cancel.cancel();
            removed_total += 1;
            tracing::info!(
                region = ?tc.region,
                team = ?team_id,
                teams_on_members = representative,
                server_teams = total - 1,
                desired = desired_server_teams,
                "removed over-represented server team"
            );
            Some(team.servers)
        };

        if let Some(servers) = converted {
            tc.register_team(servers, true, true);
            tc.request_build();
        }
    }
}

/// Retire servers whose storage engine no longer matches the configuration,
/// one per pass so replacements can be recruited in between.
pub async fn wrong_engine_remover(tc: Arc<TeamCollection>) {
    loop {
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tokio::time::sleep(tc.cfg.remove_wrong_engine_delay) => {}
        }
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            _ = tc.wait_until_healthy(tc.cfg.remove_team_extra_delay) => {}
        }

        let marked = {
            let mut state = tc.write();
            let mut marked = None;
            let candidates: Vec<crate::types::Uid> = state
                .servers
                .iter()
                .filter(|(id, r)| {
                    r.engine != EngineType::Unset
                        && r.engine != tc.cfg.engine
                        && !r.wrong_engine_to_remove
                        && (tc.cfg.migration_mode == MigrationMode::Aggressive
                            || state.status(**id).wiggling)
                })
                .map(|(id, _)| *id)
                .collect();
            if let Some(id) = candidates.first().copied() {
                if let Some(record) = state.servers.get_mut(&id) {
                    record.wrong_engine_to_remove = true;
                    marked = Some((id, Arc::clone(&record.wake)));
                }
            }
            marked
        };
        if let Some((id, wake)) = marked {
            tracing::warn!(region = ?tc.region, server = %id, "retiring server with wrong engine");
            wake.notify_one();
        }
    }
}
