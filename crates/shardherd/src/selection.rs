//! Destination-team selection for the move queue.
//!
//! The metric is adjusted used-disk bytes: the mean of member load reports
//! (doubled when a member has not reported), plus penalized in-flight bytes,
//! scaled up sharply as the team's worst free-space ratio approaches the
//! cutoff. Only healthy teams are eligible; a fallback path hands back an
//! unhealthy source team when nothing healthy exists so the queue is never
//! wedged.

use std::time::Instant;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::config::TeamCollectionConfig;
use crate::external::ShardMap;
use crate::state::{CollectionState, ServerTeam, TeamId};
use crate::types::Uid;

#[derive(Debug, Clone, Default)]
pub struct GetTeamRequest {
    /// Servers currently holding the shard (any replica).
    pub src: Vec<Uid>,
    /// Servers known to hold a complete copy.
    pub complete_sources: Vec<Uid>,
    /// Scan every team for the best metric instead of sampling.
    pub wants_true_best: bool,
    /// Optimize for low utilization (destination) vs high (source).
    pub prefer_lower_utilization: bool,
    /// When false, prefer a healthy team already among the sources.
    pub wants_new_servers: bool,
    /// Only consider teams that currently own at least one shard.
    pub team_must_have_shards: bool,
    /// Weight applied to in-flight bytes in the load metric.
    pub inflight_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamDesc {
    pub id: TeamId,
    pub servers: Vec<Uid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamSelection {
    pub team: Option<TeamDesc>,
    /// Whether any requested source server is still registered.
    pub found_src: bool,
}

/// Mean of member load reports; the sum is doubled when any member has not
/// reported, so silent teams look expensive.
pub fn team_load_average(state: &CollectionState, team: &ServerTeam) -> i64 {
    let mut sum = 0i64;
    let mut replied = 0i64;
    for s in &team.servers {
        if let Some(metrics) = state.servers.get(s).and_then(|r| r.metrics) {
            sum += metrics.load_bytes;
            replied += 1;
        }
    }
    if replied < team.servers.len() as i64 {
        sum *= 2;
    }
    if replied == 0 {
        0
    } else {
        sum / replied
    }
}

pub fn team_data_in_flight(state: &CollectionState, team: &ServerTeam) -> i64 {
    team.servers
        .iter()
        .filter_map(|s| state.servers.get(s))
        .map(|r| r.data_in_flight)
        .sum()
}

/// Worst free-space ratio across members, in-flight bytes subtracted.
pub fn team_min_available_space_ratio(
    state: &CollectionState,
    team: &ServerTeam,
    include_in_flight: bool,
) -> f64 {
    let mut min_ratio = 1.0f64;
    for s in &team.servers {
        let Some(record) = state.servers.get(s) else {
            continue;
        };
        let Some(metrics) = record.metrics else {
            continue;
        };
        let mut available = metrics.available_bytes;
        if include_in_flight {
            available = (available - record.data_in_flight).max(0);
        }
        if metrics.capacity_bytes == 0 {
            min_ratio = 0.0;
        } else {
            min_ratio = min_ratio.min(available as f64 / metrics.capacity_bytes as f64);
        }
    }
    min_ratio
}

/// Worst absolute free bytes across members; can go negative with in-flight
/// data counted.
pub fn team_min_available_space(
    state: &CollectionState,
    team: &ServerTeam,
    include_in_flight: bool,
) -> i64 {
    let mut min_space = i64::MAX;
    for s in &team.servers {
        let Some(record) = state.servers.get(s) else {
            continue;
        };
        let Some(metrics) = record.metrics else {
            continue;
        };
        let mut available = metrics.available_bytes;
        if include_in_flight {
            available -= record.data_in_flight;
        }
        min_space = min_space.min(available);
    }
    min_space
}

pub fn team_has_healthy_available_space(
    state: &CollectionState,
    cfg: &TeamCollectionConfig,
    team: &ServerTeam,
    min_ratio: f64,
) -> bool {
    team_min_available_space_ratio(state, team, true) >= min_ratio
        && team_min_available_space(state, team, true) > cfg.min_available_space_bytes
}

/// The selection metric; smaller is lower utilization.
pub fn team_load_bytes(
    state: &CollectionState,
    cfg: &TeamCollectionConfig,
    team: &ServerTeam,
    inflight_penalty: f64,
) -> i64 {
    let physical = team_load_average(state, team);
    let min_ratio = team_min_available_space_ratio(state, team, true);
    let in_flight = if team.servers.is_empty() {
        0
    } else {
        team_data_in_flight(state, team) / team.servers.len() as i64
    };
    let cutoff = cfg.available_space_ratio_cutoff;
    let mut multiplier = cutoff / cutoff.min(min_ratio).max(1e-6);
    if team.servers.len() > 2 {
        // With three or more replicas the penalty must dominate early enough
        // that a member at 20% free space is always avoided.
        multiplier *= multiplier;
    }
    if min_ratio < cfg.target_available_space_ratio {
        tracing::warn!(
            team = ?team.id,
            available_ratio = min_ratio,
            "member disk near capacity"
        );
    }
    ((physical as f64 + inflight_penalty * in_flight as f64) * multiplier) as i64
}

/// Refresh the cached median free-space ratio over healthy teams, clamped to
/// the configured band.
fn refresh_median_available_space(
    state: &mut CollectionState,
    cfg: &TeamCollectionConfig,
    now: Instant,
) {
    if let Some(last) = state.last_median_update {
        if now.duration_since(last) < cfg.available_space_update_delay {
            return;
        }
    }
    state.last_median_update = Some(now);

    let mut ratios: Vec<f64> = state
        .good_teams()
        .filter(|t| t.healthy)
        .map(|t| team_min_available_space_ratio(state, t, true))
        .collect();
    if ratios.len() > 1 {
        let pivot = ratios.len() / 2;
        ratios.select_nth_unstable_by(pivot, |a, b| a.partial_cmp(b).expect("no NaN ratios"));
        state.median_available_space = ratios[pivot]
            .clamp(cfg.min_available_space_ratio, cfg.target_available_space_ratio);
    } else {
        state.median_available_space = cfg.min_available_space_ratio;
    }
    if state.median_available_space < cfg.target_available_space_ratio {
        tracing::warn!(
            median_ratio = state.median_available_space,
            target_ratio = cfg.target_available_space_ratio,
            "median available space below target"
        );
    }
}

/// Pick the best destination (or source) team for a relocation.
pub fn select_team(
    state: &mut CollectionState,
    cfg: &TeamCollectionConfig,
    rng: &mut SmallRng,
    shard_map: &dyn ShardMap,
    primary: bool,
    now: Instant,
    req: &GetTeamRequest,
) -> TeamSelection {
    refresh_median_available_space(state, cfg, now);

    let found_src = req.src.iter().any(|s| state.servers.contains_key(s));
    let none = TeamSelection { team: None, found_src };

    if state.server_teams.is_empty() {
        return none;
    }

    let complete: std::collections::BTreeSet<Uid> = req.complete_sources.iter().copied().collect();

    // A healthy team fully inside the sources avoids any data movement.
    if !req.wants_new_servers {
        for source in &req.complete_sources {
            let Some(record) = state.servers.get(source) else {
                continue;
            };
            for team_id in &record.teams {
                let Some(team) = state.server_teams.get(team_id) else {
                    continue;
                };
                if team.healthy && team.servers.iter().all(|s| complete.contains(s)) {
                    return TeamSelection {
                        team: Some(TeamDesc { id: team.id, servers: team.servers.clone() }),
                        found_src,
                    };
                }
            }
        }
    }

    let eligible = |state: &CollectionState, team: &ServerTeam| -> bool {
        team.healthy
            && (!req.prefer_lower_utilization
                || team_has_healthy_available_space(state, cfg, team, state.median_available_space))
            && (!req.team_must_have_shards
                || !shard_map.shards_for_team(&team.servers, primary).is_empty())
    };

    let mut best: Option<(TeamId, i64)> = None;
    let better = |load: i64, best_load: i64| {
        if req.prefer_lower_utilization {
            load < best_load
        } else {
            load > best_load
        }
    };

    let team_ids: Vec<TeamId> = state.good_teams().map(|t| t.id).collect();
    if team_ids.is_empty() {
        // Only bad teams remain; fall through to the zero-healthy fallback.
    } else if req.wants_true_best {
        let start_index = if req.prefer_lower_utilization {
            state.lowest_utilization_team
        } else {
            state.highest_utilization_team
        } % team_ids.len().max(1);

        let mut best_index = start_index;
        for offset in 0..team_ids.len() {
            let index = (start_index + offset) % team_ids.len();
            let team = &state.server_teams[&team_ids[index]];
            if !eligible(state, team) {
                continue;
            }
            let load = team_load_bytes(state, cfg, team, req.inflight_penalty);
            if best.map_or(true, |(_, b)| better(load, b)) {
                best = Some((team.id, load));
                best_index = index;
            }
        }
        // Remember where the best sat so equal teams rotate across calls.
        if req.prefer_lower_utilization {
            state.lowest_utilization_team = best_index;
        } else {
            state.highest_utilization_team = best_index;
        }
    } else {
        let mut candidates: Vec<TeamId> = Vec::new();
        let mut tries = 0usize;
        while candidates.len() < cfg.best_team_option_count && tries < cfg.best_team_max_tries {
            let pick = *team_ids.choose(rng).expect("team list not empty");
            let team = &state.server_teams[&pick];
            let ok = eligible(state, team) && !candidates.contains(&pick);
            if ok {
                candidates.push(pick);
            } else {
                tries += 1;
            }
        }

        // Healthy teams exist but none qualified: selection is stuck, which
        // the wiggle health guard watches.
        if candidates.is_empty() && !*state.zero_healthy_teams_tx.borrow() {
            state.best_team_stuck_count += 1;
        } else {
            state.best_team_stuck_count = 0;
        }

        for pick in candidates {
            let team = &state.server_teams[&pick];
            let load = team_load_bytes(state, cfg, team, req.inflight_penalty);
            if best.map_or(true, |(_, b)| better(load, b)) {
                best = Some((pick, load));
            }
        }
    }

    // Last resort with zero healthy teams: any team fully inside the
    // complete sources, healthy or not, keeps the queue moving.
    if best.is_none() && *state.zero_healthy_teams_tx.borrow() {
        for source in &req.complete_sources {
            let Some(record) = state.servers.get(source) else {
                continue;
            };
            for team_id in &record.teams {
                let Some(team) = state.server_teams.get(team_id) else {
                    continue;
                };
                if team.servers.iter().all(|s| complete.contains(s)) {
                    return TeamSelection {
                        team: Some(TeamDesc { id: team.id, servers: team.servers.clone() }),
                        found_src,
                    };
                }
            }
        }
    }

    TeamSelection {
        team: best.map(|(id, _)| TeamDesc {
            id,
            servers: state.server_teams[&id].servers.clone(),
        }),
        found_src,
    }
}
