//! Initial-state loading.
//!
//! On startup the collection reads the server list and the shard→team
//! mapping, registers every known server, and re-creates every historical
//! team (deduped). Teams that no longer meet the size or policy invariant
//! come back as bad teams; the add-subset pass then tries to promote a
//! policy-satisfying subset of each bad team into a good team so data can
//! move with minimal copying. The bad-team remover waits on that pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::collection::TeamCollection;
use crate::error::Result;
use crate::external::{MetaStore, ServerListEntry, ShardAssignment, MODE_KEY};
use crate::locality::Locality;
use crate::types::Uid;

/// Everything read from persistent state at startup.
pub struct InitialDataDistribution {
    /// Data-distribution mode flag: 0 disables relocation entirely.
    pub mode: i32,
    pub servers: Vec<ServerListEntry>,
    pub shards: Vec<ShardAssignment>,
    pub primary_teams: BTreeSet<Vec<Uid>>,
    pub remote_teams: BTreeSet<Vec<Uid>>,
}

fn sorted(mut team: Vec<Uid>) -> Vec<Uid> {
    team.sort();
    team.dedup();
    team
}

pub async fn load_initial_data_distribution(
    meta: &dyn MetaStore,
) -> Result<InitialDataDistribution> {
    let mode = meta
        .get(MODE_KEY)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let servers = meta.server_list().await?;
    let shards = meta.shard_assignments().await?;

    let mut primary_teams = BTreeSet::new();
    let mut remote_teams = BTreeSet::new();
    for shard in &shards {
        if !shard.primary_src.is_empty() {
            primary_teams.insert(sorted(shard.primary_src.clone()));
        }
        if !shard.primary_dest.is_empty() {
            primary_teams.insert(sorted(shard.primary_dest.clone()));
        }
        if !shard.remote_src.is_empty() {
            remote_teams.insert(sorted(shard.remote_src.clone()));
        }
        if !shard.remote_dest.is_empty() {
            remote_teams.insert(sorted(shard.remote_dest.clone()));
        }
    }

    Ok(InitialDataDistribution { mode, servers, shards, primary_teams, remote_teams })
}

/// Seed the registries from the loaded snapshot and run the add-subset
/// promotion pass. Must run before the background tasks start sweeping.
pub async fn initialize(tc: &Arc<TeamCollection>, init: &InitialDataDistribution) {
    if init.mode == 0 {
        tracing::warn!(region = ?tc.region, "data distribution mode is disabled");
    }
    for entry in &init.servers {
        tc.register_server(entry.clone());
    }
    // Team classification and the add-subset pass both read server statuses,
    // so let every tracker publish its first verdict before continuing.
    loop {
        let pending = {
            let state = tc.read();
            state
                .servers
                .keys()
                .chain(state.tss.keys())
                .any(|id| !state.status_initialized(*id))
        };
        if !pending {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let teams = if tc.region.is_primary() {
        &init.primary_teams
    } else {
        &init.remote_teams
    };
    for team in teams {
        let good = {
            let state = tc.read();
            team.len() == tc.cfg.team_size
                && team.iter().all(|s| state.servers.contains_key(s))
                && state.satisfies_policy(&tc.cfg.policy, team)
        };
        // Historical teams that shrank, lost members, or straddle a policy
        // change are tracked only until their data moves off.
        tc.register_team(team.clone(), !good, false);
        tokio::task::yield_now().await;
    }

    tracing::info!(
        region = ?tc.region,
        servers = init.servers.len(),
        teams = teams.len(),
        shards = init.shards.len(),
        "initial data distribution loaded"
    );

    add_subset_of_emergency_teams(tc).await;
    let _ = tc.add_subset_complete.send(true);
}

/// For each bad team with enough healthy members, promote a
/// policy-satisfying subset into a good team unless one already exists.
pub async fn add_subset_of_emergency_teams(tc: &Arc<TeamCollection>) {
    let bad_teams: Vec<Vec<Uid>> = {
        let state = tc.read();
        state.bad_teams().map(|t| t.servers.clone()).collect()
    };

    for team in bad_teams {
        let promotion = {
            let state = tc.read();
            let healthy: Vec<Uid> = team
                .iter()
                .copied()
                .filter(|s| {
                    state.servers.get(s).map_or(false, |r| r.in_desired_dc)
                        && !state.status(*s).is_unhealthy()
                })
                .collect();
            if healthy.len() < tc.cfg.team_size {
                None
            } else {
                let healthy_set: BTreeSet<Uid> = healthy.iter().copied().collect();
                // An existing team fully inside the healthy subset already
                // serves the purpose.
                let covered = healthy.iter().any(|s| {
                    state.servers[s].teams.iter().any(|t| {
                        state
                            .server_teams
                            .get(t)
                            .map_or(false, |t| {
                                !t.bad && t.servers.iter().all(|m| healthy_set.contains(m))
                            })
                    })
                });
                if covered {
                    None
                } else {
                    let locs: Vec<&Locality> =
                        healthy.iter().map(|s| &state.servers[s].locality).collect();
                    if !tc.cfg.policy.satisfies(&locs) {
                        tracing::warn!(
                            region = ?tc.region,
                            team = ?team,
                            "cannot promote any subset of bad team"
                        );
                        None
                    } else if healthy.len() == tc.cfg.team_size {
                        Some(healthy)
                    } else {
                        tc.with_rng(|rng| tc.cfg.policy.select_replicas(&locs, &[], rng))
                            .filter(|subset| subset.len() == tc.cfg.team_size)
                            .map(|subset| subset.into_iter().map(|i| healthy[i]).collect())
                    }
                }
            }
        };
        if let Some(servers) = promotion {
            tracing::info!(region = ?tc.region, team = ?servers, "promoted subset of bad team");
            tc.register_team(servers, false, false);
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyRange;

    fn uid(n: u64) -> Uid {
        Uid(n, n)
    }

    #[test]
    fn teams_are_deduped_across_shards() {
        let shard = |srcs: Vec<u64>| ShardAssignment {
            range: KeyRange::new(b"a".to_vec(), b"b".to_vec()),
            primary_src: srcs.into_iter().map(uid).collect(),
            primary_dest: vec![],
            remote_src: vec![],
            remote_dest: vec![],
        };
        let shards = vec![shard(vec![1, 2, 3]), shard(vec![3, 2, 1]), shard(vec![2, 3, 4])];
        let mut primary = BTreeSet::new();
        for s in &shards {
            primary.insert(sorted(s.primary_src.clone()));
        }
        assert_eq!(primary.len(), 2);
    }
}
