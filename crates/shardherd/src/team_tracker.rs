//! Per-team health tracking.
//!
//! One task per server team. It recomputes the team's aggregate state
//! whenever a member's status, the zero-healthy flag, or the startup grace
//! period changes, maintains the collection counters and the team's priority
//! bucket, and emits relocation requests for every shard the team owns once
//! degradation is actionable.

use std::sync::Arc;

use futures_util::future::{select_all, BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::collection::TeamCollection;
use crate::state::TeamId;
use crate::types::{priority, Fitness, RelocateShard, Uid};

/// Priority table; first matching row wins.
pub fn compute_priority(
    cfg_team_size: usize,
    member_count: usize,
    servers_left: usize,
    undesired: usize,
    wrong_configuration: usize,
    wiggling: usize,
    bad: bool,
    redundant: bool,
) -> i32 {
    if member_count == 0 {
        priority::POPULATE_REGION
    } else if servers_left < cfg_team_size {
        match servers_left {
            0 => priority::TEAM_0_LEFT,
            1 => priority::TEAM_1_LEFT,
            2 => priority::TEAM_2_LEFT,
            _ => priority::TEAM_UNHEALTHY,
        }
    } else if !bad && wiggling > 0 && wiggling == wrong_configuration && wiggling == undesired {
        // Every undesired / wrong-configured member is the wiggling one.
        priority::PERPETUAL_STORAGE_WIGGLE
    } else if bad || wrong_configuration > 0 {
        if redundant {
            priority::TEAM_REDUNDANT
        } else {
            priority::TEAM_UNHEALTHY
        }
    } else if undesired > 0 {
        priority::TEAM_CONTAINS_UNDESIRED_SERVER
    } else {
        priority::TEAM_HEALTHY
    }
}

struct TeamSnapshot {
    servers_left: usize,
    undesired: usize,
    wrong_configuration: usize,
    wiggling: usize,
    optimal: bool,
    contains_failed: bool,
}

fn snapshot(tc: &TeamCollection, members: &[Uid]) -> TeamSnapshot {
    let state = tc.read();
    let mut snap = TeamSnapshot {
        servers_left: 0,
        undesired: 0,
        wrong_configuration: 0,
        wiggling: 0,
        optimal: true,
        contains_failed: false,
    };
    for id in members {
        let status = state.status(*id);
        if !status.failed {
            snap.servers_left += 1;
        }
        if status.undesired {
            snap.undesired += 1;
        }
        if status.wrong_configuration {
            snap.wrong_configuration += 1;
        }
        if status.wiggling {
            snap.wiggling += 1;
        }
        if let Some(record) = state.servers.get(id) {
            if record.process_class.storage_fitness() > Fitness::Neutral {
                snap.optimal = false;
            }
            if state.worst_exclusion(record).0 == crate::types::ExclusionStatus::Failed {
                snap.contains_failed = true;
            }
        } else {
            snap.optimal = false;
        }
    }
    snap
}

pub async fn run(tc: Arc<TeamCollection>, team_id: TeamId, bad: bool, redundant: bool) {
    let (cancel, members) = {
        let state = tc.read();
        let Some(team) = state.server_teams.get(&team_id) else {
            return;
        };
        (team.cancel.clone(), team.servers.clone())
    };

    let mut status_rx: Vec<_> = {
        let state = tc.read();
        members
            .iter()
            .filter_map(|id| state.server_or_tss(*id).map(|r| r.status_tx.subscribe()))
            .collect()
    };
    let mut zero_healthy = tc.zero_healthy_teams();
    let mut ready = tc.failure_delay_ready.subscribe();

    let mut last_servers_left = members.len();
    let mut last_undesired = false;
    let mut last_wrong_configuration = {
        let state = tc.read();
        state
            .server_teams
            .get(&team_id)
            .map_or(false, |t| t.wrong_configuration)
    };
    let mut last_wiggling = false;
    let mut last_ready = *ready.borrow();
    let mut last_zero_healthy = *zero_healthy.borrow();
    let mut first_check = true;
    let mut zero_left_logger: Option<CancellationToken> = None;

    tracing::debug!(region = ?tc.region, team = ?team_id, bad, "team tracker starting");

    loop {
        let snap = snapshot(&tc, &members);
        let ready_now = *ready.borrow();
        let zero_now = *zero_healthy.borrow();

        let healthy =
            !bad && snap.undesired == 0 && snap.servers_left == tc.cfg.team_size;
        let optimal = healthy && snap.optimal;
        let recheck = !healthy
            && (last_ready != ready_now
                || (last_zero_healthy && !zero_now)
                || snap.contains_failed);

        last_ready = ready_now;
        last_zero_healthy = zero_now;

        if first_check {
            first_check = false;
            tc.write().set_team_health(team_id, healthy, optimal);
        }

        let changed = snap.servers_left != last_servers_left
            || (snap.undesired > 0) != last_undesired
            || (snap.wrong_configuration > 0) != last_wrong_configuration
            || (snap.wiggling > 0) != last_wiggling
            || recheck;

        if changed {
            let (last_priority, new_priority) = {
                let mut state = tc.write();
                let last = state
                    .server_teams
                    .get(&team_id)
                    .map_or(priority::TEAM_HEALTHY, |t| t.priority);
                if let Some(team) = state.server_teams.get_mut(&team_id) {
                    team.wrong_configuration = snap.wrong_configuration > 0;
                }
                state.set_team_health(team_id, healthy, optimal);
                let new = compute_priority(
                    tc.cfg.team_size,
                    members.len(),
                    snap.servers_left,
                    snap.undesired,
                    snap.wrong_configuration,
                    snap.wiggling,
                    bad,
                    redundant,
                );
                state.set_team_priority(team_id, new);
                if state.healthy_team_count == 0 && !healthy {
                    tracing::warn!(
                        region = ?tc.region,
                        team = ?team_id,
                        "zero healthy server teams"
                    );
                }
                (last, new)
            };

            tracing::debug!(
                region = ?tc.region,
                team = ?team_id,
                servers_left = snap.servers_left,
                undesired = snap.undesired,
                wiggling = snap.wiggling,
                wrong_configuration = snap.wrong_configuration,
                priority = new_priority,
                healthy,
                "team health changed"
            );

            if last_priority != new_priority {
                if last_priority == priority::TEAM_0_LEFT
                    && new_priority < priority::TEAM_0_LEFT
                {
                    if let Some(logger) = zero_left_logger.take() {
                        logger.cancel();
                    }
                }
                if new_priority == priority::TEAM_0_LEFT {
                    tracing::warn!(
                        region = ?tc.region,
                        team = ?team_id,
                        "no replicas remain of some data"
                    );
                    let token = CancellationToken::new();
                    zero_left_logger = Some(token.clone());
                    let tc2 = Arc::clone(&tc);
                    let members2 = members.clone();
                    tc.spawn(async move {
                        zero_server_left_logger(tc2, team_id, members2, token).await;
                    });
                }
            }

            last_servers_left = snap.servers_left;
            last_undesired = snap.undesired > 0;
            last_wrong_configuration = snap.wrong_configuration > 0;
            last_wiggling = snap.wiggling > 0;

            if (ready_now && !zero_now) || snap.contains_failed {
                emit_relocations(&tc, team_id, &members, snap.contains_failed, redundant);
            }
        }

        // Wait for any member status transition or a collection-wide signal.
        let mut waits: Vec<BoxFuture<'_, ()>> = Vec::new();
        for rx in status_rx.iter_mut() {
            waits.push(Box::pin(async move {
                let _ = rx.changed().await;
            }));
        }
        waits.push(Box::pin(async {
            let _ = zero_healthy.changed().await;
        }));
        waits.push(Box::pin(async {
            let _ = ready.changed().await;
        }));

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(logger) = zero_left_logger.take() {
                    logger.cancel();
                }
                tracing::debug!(region = ?tc.region, team = ?team_id, "team tracker stopping");
                return;
            }
            _ = select_all(waits) => {}
        }
    }
}

/// One relocation per owned shard, at the worst priority across every team
/// (local and sibling region) still mapped to the shard.
fn emit_relocations(
    tc: &TeamCollection,
    team_id: TeamId,
    members: &[Uid],
    contains_failed: bool,
    redundant: bool,
) {
    let (own_priority, shards) = {
        let state = tc.read();
        let Some(team) = state.server_teams.get(&team_id) else {
            return;
        };
        (
            team.priority,
            tc.deps
                .shard_map
                .shards_for_team(members, tc.region.is_primary()),
        )
    };

    for shard in shards {
        let mut max_priority = if contains_failed {
            priority::TEAM_FAILED
        } else {
            own_priority
        };
        if max_priority < priority::TEAM_FAILED {
            // Splits, merges, and restarts can map a shard to several teams;
            // the emitted priority must cover the worst of them.
            let (primary_teams, remote_teams) = tc.deps.shard_map.teams_for_shard(&shard);
            let groups = [(primary_teams, true), (remote_teams, false)];
            'teams: for (teams, teams_primary) in groups {
                for team_servers in teams {
                    if team_servers.is_empty() {
                        max_priority = max_priority.max(priority::POPULATE_REGION);
                        break 'teams;
                    }
                    let owner = if teams_primary == tc.region.is_primary() {
                        tc.team_priority_for(&team_servers)
                    } else {
                        match tc.peer() {
                            Some(peer) => peer.team_priority_for(&team_servers),
                            // Sibling torn down mid-flight; degrade to local
                            // knowledge.
                            None => None,
                        }
                    };
                    let p = owner.unwrap_or(if redundant {
                        priority::TEAM_REDUNDANT
                    } else {
                        priority::TEAM_UNHEALTHY
                    });
                    max_priority = max_priority.max(p);
                }
            }
        }
        tc.send_relocation(RelocateShard { keys: shard, priority: max_priority });
    }
}

/// Delayed diagnostic fired when a team loses its last server: totals the
/// bytes of the shards that may have lost all replicas.
async fn zero_server_left_logger(
    tc: Arc<TeamCollection>,
    team_id: TeamId,
    members: Vec<Uid>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tc.cancel.cancelled() => return,
        _ = tokio::time::sleep(tc.cfg.zero_server_left_log_delay) => {}
    }
    let shards = tc
        .deps
        .shard_map
        .shards_for_team(&members, tc.region.is_primary());
    let mut bytes_lost = 0u64;
    for shard in &shards {
        tracing::warn!(region = ?tc.region, team = ?team_id, shard = ?shard, "shard lost");
        bytes_lost += tc.deps.shard_map.shard_bytes(shard);
    }
    tracing::warn!(
        region = ?tc.region,
        team = ?team_id,
        shards = shards.len(),
        bytes_lost,
        "zero servers left in team"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_table_first_match_wins() {
        // Empty team.
        assert_eq!(compute_priority(3, 0, 0, 0, 0, 0, false, false), priority::POPULATE_REGION);
        // Progressive server loss.
        assert_eq!(compute_priority(3, 3, 2, 1, 0, 0, false, false), priority::TEAM_2_LEFT);
        assert_eq!(compute_priority(3, 3, 1, 2, 0, 0, false, false), priority::TEAM_1_LEFT);
        assert_eq!(compute_priority(3, 3, 0, 3, 0, 0, false, false), priority::TEAM_0_LEFT);
        // Larger (bad) team short of the configured size.
        assert_eq!(compute_priority(4, 5, 3, 0, 0, 0, true, false), priority::TEAM_UNHEALTHY);
    }

    #[test]
    fn wiggle_priority_requires_wiggler_to_cover_all_degradation() {
        // The only undesired/wrong-configured member is the wiggling one.
        assert_eq!(
            compute_priority(3, 3, 3, 1, 1, 1, false, false),
            priority::PERPETUAL_STORAGE_WIGGLE
        );
        // A second undesired member that is not wiggling demotes the team.
        assert_eq!(
            compute_priority(3, 3, 3, 2, 1, 1, false, false),
            priority::TEAM_UNHEALTHY
        );
    }

    #[test]
    fn redundant_and_bad_teams_rank_between_undesired_and_unhealthy() {
        assert_eq!(compute_priority(3, 3, 3, 0, 0, 0, true, true), priority::TEAM_REDUNDANT);
        assert_eq!(compute_priority(3, 3, 3, 0, 0, 0, true, false), priority::TEAM_UNHEALTHY);
        assert_eq!(
            compute_priority(3, 3, 3, 1, 0, 0, false, false),
            priority::TEAM_CONTAINS_UNDESIRED_SERVER
        );
        assert_eq!(compute_priority(3, 3, 3, 0, 0, 0, false, false), priority::TEAM_HEALTHY);
    }
}
