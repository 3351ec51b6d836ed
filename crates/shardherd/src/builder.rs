//! Team construction.
//!
//! Machine teams come first: the builder picks a least-used healthy machine,
//! forces it into a policy selection over machine localities, and keeps the
//! lowest-scoring attempt. Server teams are then drawn from machine teams:
//! one least-used healthy server, a *random* healthy machine team containing
//! it, and one random healthy server from each other machine in that team.
//!
//! Random (rather than least-used) machine-team choice matters: freshly
//! added machines are all least-used at once, and always preferring them
//! would correlate new teams onto the same small machine set.
//!
//! Scores favor members on few teams; overlap with an existing team is
//! penalized, and a complete overlap voids the attempt.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::config::TeamCollectionConfig;
use crate::locality::Locality;
use crate::state::{CollectionState, MachineId, MachineTeamId};
use crate::types::Uid;

/// Hard cap on candidate attempts per team, even after overlap extensions.
const MAX_ATTEMPTS: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub added_machine_teams: usize,
    pub added_teams: usize,
}

/// One full build pass. Only ever adds teams; removal is the removers' job.
pub fn build_teams(
    state: &mut CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
) -> BuildOutcome {
    let mut outcome = BuildOutcome::default();

    let healthy_servers = state.healthy_server_count();
    let unique_machines: std::collections::BTreeSet<&str> = state
        .servers
        .iter()
        .filter(|(id, _)| !state.status(**id).is_unhealthy())
        .filter_map(|(_, r)| r.locality.zone_id())
        .collect();

    tracing::debug!(
        servers = state.servers.len(),
        healthy = healthy_servers,
        unique_machines = unique_machines.len(),
        team_size = cfg.team_size,
        "starting team build pass"
    );

    if unique_machines.len() < cfg.team_size {
        // Too few failure domains to host even one team.
        return outcome;
    }

    let desired_teams = cfg.desired_teams_per_server * healthy_servers;
    let max_teams = cfg.max_teams_per_server * healthy_servers;

    // Teams whose members are wrong-configured are on the way out and do not
    // count toward either bound.
    let mut healthy_count = 0usize;
    let mut total_count = 0usize;
    for team in state.good_teams() {
        if !team.wrong_configuration {
            if team.healthy {
                healthy_count += 1;
            }
            total_count += 1;
        }
    }

    // Bounded this way, a transient all-unhealthy dip cannot make us build
    // an unbounded number of replacement teams.
    let teams_to_build = (desired_teams.saturating_sub(healthy_count))
        .min(max_teams.saturating_sub(total_count));

    state.last_build_teams_failed = false;
    if teams_to_build > 0 || not_enough_teams_for_a_server(state, cfg) {
        outcome = add_teams_best_of(state, cfg, rng, teams_to_build);
    }

    tracing::debug!(
        added_teams = outcome.added_teams,
        added_machine_teams = outcome.added_machine_teams,
        teams_to_build,
        desired_teams,
        max_teams,
        current_teams = state.good_teams().count(),
        machine_teams = state.machine_teams.len(),
        build_failed = state.last_build_teams_failed,
        "team build pass finished"
    );
    outcome
}

/// True when some healthy machine sits on fewer machine teams than the
/// per-machine target.
pub fn not_enough_machine_teams_for_a_machine(
    state: &CollectionState,
    cfg: &TeamCollectionConfig,
) -> bool {
    let target = if cfg.remove_team_with_most_teams {
        cfg.target_teams_per_server()
    } else {
        cfg.desired_teams_per_server
    };
    state
        .machines
        .values()
        .any(|m| m.machine_teams.len() < target && state.is_machine_healthy(&m.id))
}

/// True when some healthy server sits on fewer teams than the per-server
/// target. The target is padded above `desired_teams_per_server` so the
/// server-team remover has slack to rebalance without re-triggering builds.
pub fn not_enough_teams_for_a_server(state: &CollectionState, cfg: &TeamCollectionConfig) -> bool {
    let target = cfg.target_teams_per_server().max(1);
    state
        .servers
        .iter()
        .any(|(id, r)| r.teams.len() < target && !state.status(*id).is_unhealthy())
}

/// Build machine teams until the requested count is reached and no healthy
/// machine is under-teamed. Returns the number actually added.
fn add_best_machine_teams(
    state: &mut CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
    machine_teams_to_build: usize,
) -> usize {
    let mut added = 0usize;
    if state.machines.len() < cfg.team_size {
        return 0;
    }

    while added < machine_teams_to_build || not_enough_machine_teams_for_a_machine(state, cfg) {
        // Machine locality map: one representative locality per healthy
        // machine with usable locality.
        let candidates: Vec<(MachineId, Locality)> = state
            .machines
            .values()
            .filter(|m| state.is_machine_healthy(&m.id))
            .filter_map(|m| {
                let rep = state.servers.get(m.servers.first()?)?;
                cfg.policy
                    .valid_locality(&rep.locality)
                    .then(|| (m.id.clone(), rep.locality.clone()))
            })
            .collect();

        let min_team_count = candidates
            .iter()
            .filter_map(|(id, _)| state.machines.get(id).map(|m| m.machine_teams.len()))
            .min();
        let Some(min_team_count) = min_team_count else {
            // No healthy machine with valid locality; nothing will ever be
            // built from here.
            return added;
        };
        let least_used: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, (id, _))| {
                state.machines.get(id).map(|m| m.machine_teams.len()) == Some(min_team_count)
            })
            .map(|(idx, _)| idx)
            .collect();

        let locs: Vec<&Locality> = candidates.iter().map(|(_, l)| l).collect();
        let mut best: Option<(Vec<MachineId>, usize)> = None;
        let mut max_attempts = cfg.build_attempts;
        let mut attempt = 0usize;
        while attempt < max_attempts && attempt < MAX_ATTEMPTS {
            attempt += 1;
            let forced = *least_used.choose(rng).expect("least_used not empty");
            let Some(selected) = cfg.policy.select_replicas(&locs, &[forced], rng) else {
                continue;
            };
            if selected.len() != cfg.team_size {
                continue;
            }
            let mut machine_ids: Vec<MachineId> =
                selected.iter().map(|&i| candidates[i].0.clone()).collect();
            machine_ids.sort();

            let overlap = state.overlapping_machine_members(&machine_ids);
            if overlap == machine_ids.len() {
                max_attempts += 1;
                continue;
            }

            let score: usize = machine_ids
                .iter()
                .filter_map(|m| state.machines.get(m).map(|m| m.machine_teams.len()))
                .sum::<usize>()
                + cfg.overlap_penalty * overlap;
            if best.as_ref().map_or(true, |(_, s)| score < *s) {
                best = Some((machine_ids, score));
            }
        }

        match best {
            Some((machine_ids, _)) => {
                state.find_or_create_machine_team(machine_ids);
                added += 1;
            }
            None => {
                tracing::warn!(
                    added,
                    requested = machine_teams_to_build,
                    "unable to assemble further machine teams"
                );
                state.last_build_teams_failed = true;
                break;
            }
        }
    }

    added
}

/// The healthy server with the fewest teams and a policy-usable locality,
/// random among ties.
fn find_one_least_used_server(
    state: &CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
) -> Option<Uid> {
    let mut least: Vec<Uid> = Vec::new();
    let mut min_teams = usize::MAX;
    for (id, record) in &state.servers {
        if state.status(*id).is_unhealthy() || !cfg.policy.valid_locality(&record.locality) {
            continue;
        }
        let teams = record.teams.len();
        if teams < min_teams {
            min_teams = teams;
            least.clear();
        }
        if teams == min_teams {
            least.push(*id);
        }
    }
    if least.is_empty() {
        tracing::debug!(
            servers = state.servers.len(),
            unhealthy = state.unhealthy_servers,
            "no healthy server with usable locality"
        );
        return None;
    }
    least.choose(rng).copied()
}

/// A random healthy machine team containing the chosen server's machine.
fn find_one_random_machine_team(
    state: &CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
    server: Uid,
) -> Option<MachineTeamId> {
    let machine = state.servers.get(&server)?.machine.as_ref()?;
    let healthy: Vec<MachineTeamId> = state
        .machines
        .get(machine)?
        .machine_teams
        .iter()
        .copied()
        .filter(|mt| {
            state
                .machine_teams
                .get(mt)
                .map_or(false, |mt| state.is_machine_team_healthy(mt, cfg.team_size))
        })
        .collect();
    healthy.choose(rng).copied()
}

/// Build server teams on top of the machine teams; best-of-N scoring per
/// team added.
fn add_teams_best_of(
    state: &mut CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
    teams_to_build: usize,
) -> BuildOutcome {
    let mut outcome = BuildOutcome::default();

    let healthy_machines = state.healthy_machine_count();
    let healthy_machine_teams = state.healthy_machine_team_count(cfg.team_size);
    let total_machine_teams = state.machine_teams.len();
    let desired_machine_teams = cfg.desired_teams_per_server * healthy_machines;
    let max_machine_teams = cfg.max_teams_per_server * healthy_machines;
    let machine_teams_to_build = desired_machine_teams
        .saturating_sub(healthy_machine_teams)
        .min(max_machine_teams.saturating_sub(total_machine_teams));

    if machine_teams_to_build > 0 || not_enough_machine_teams_for_a_machine(state, cfg) {
        outcome.added_machine_teams =
            add_best_machine_teams(state, cfg, rng, machine_teams_to_build);
    }

    while outcome.added_teams < teams_to_build || not_enough_teams_for_a_server(state, cfg) {
        let mut best: Option<(Vec<Uid>, usize)> = None;
        let mut max_attempts = cfg.build_attempts;
        let mut attempt = 0usize;
        let mut early_quit = false;

        while attempt < max_attempts && attempt < MAX_ATTEMPTS {
            attempt += 1;
            let Some(chosen_server) = find_one_least_used_server(state, cfg, rng) else {
                early_quit = true;
                break;
            };
            let Some(mt_id) = find_one_random_machine_team(state, cfg, rng, chosen_server) else {
                // Possibly no healthy machine team right now; retry with
                // another least-used server.
                continue;
            };

            let chosen_machine = state.servers[&chosen_server].machine.clone();
            let machines = state.machine_teams[&mt_id].machines.clone();
            let mut team: Vec<Uid> = Vec::with_capacity(cfg.team_size);
            let mut abandoned = false;
            for machine_id in &machines {
                if Some(machine_id) == chosen_machine.as_ref() {
                    team.push(chosen_server);
                    continue;
                }
                let healthy: Vec<Uid> = state.machines[machine_id]
                    .servers
                    .iter()
                    .copied()
                    .filter(|s| !state.status(*s).is_unhealthy())
                    .collect();
                match healthy.choose(rng) {
                    Some(pick) => team.push(*pick),
                    None => {
                        abandoned = true;
                        break;
                    }
                }
            }
            if abandoned || team.len() != cfg.team_size {
                continue;
            }

            team.sort();
            let overlap = state.overlapping_members(&team);
            if overlap == team.len() {
                max_attempts += 1;
                continue;
            }

            // Same metric the server-team remover uses; mixing metrics here
            // would let build and remove oscillate forever.
            let score: usize = cfg.overlap_penalty * overlap
                + team
                    .iter()
                    .map(|s| state.servers[s].teams.len())
                    .sum::<usize>();
            if best.as_ref().map_or(true, |(_, s)| score < *s) {
                best = Some((team, score));
            }
        }

        if early_quit {
            break;
        }
        let Some((team, _)) = best else {
            state.last_build_teams_failed = true;
            break;
        };
        if state.add_team(team, false, false).is_some() {
            outcome.added_teams += 1;
        } else {
            // Raced into an identical team; counts as a failed round.
            state.last_build_teams_failed = true;
            break;
        }
    }

    outcome
}
