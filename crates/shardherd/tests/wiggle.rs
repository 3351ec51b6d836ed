//! Perpetual storage wiggle: sweep progress, the health-guard pause, and
//! the enable/disable round trip.

mod common;

use common::*;
use shardherd::external::{MetaStore, WIGGLE_KEY};
use shardherd::types::{ExclusionStatus, KeyRange, Uid};

fn wiggling_addresses(state: &shardherd::state::CollectionState) -> usize {
    state
        .excluded
        .values()
        .filter(|s| **s == ExclusionStatus::Wiggling)
        .count()
}

/// Pin a shard on some team of every server so no wiggled server can finish
/// draining during the test.
fn pin_shards(cluster: &TestCluster) {
    let state = cluster.tc.read();
    for (n, record) in state.servers.values().enumerate() {
        let team = state.server_teams[&record.teams[0]].servers.clone();
        let key = format!("k{n}");
        cluster.shard_map.assign(
            KeyRange::new(key.clone().into_bytes(), format!("{key}\u{1}").into_bytes()),
            team,
            true,
            1_024,
        );
    }
}

#[tokio::test]
async fn wiggle_marks_one_process_and_pauses_under_pressure() {
    let servers = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("teams built", |s| {
            s.healthy_team_count > 0
                && s.unhealthy_servers == 0
                && s.servers.values().all(|r| !r.teams.is_empty())
        })
        .await;
    pin_shards(&cluster);

    cluster.meta.set(WIGGLE_KEY, "1").await.unwrap();
    cluster
        .wait_for("a process is wiggling", |s| {
            s.wiggling_pid.as_deref().map_or(false, |p| !p.is_empty())
                && wiggling_addresses(s) > 0
        })
        .await;
    let wiggling_pid = cluster.tc.read().wiggling_pid.clone();

    // Only one process id wiggles at a time.
    assert_eq!(cluster.tc.read().wiggle_addresses.len(), 1);

    // Queue pressure pauses the wiggle: addresses come back, pid is kept.
    cluster.shard_map.set_unhealthy_relocations(50);
    cluster
        .wait_for("wiggle paused", |s| wiggling_addresses(s) == 0)
        .await;
    assert!(*cluster.tc.pause_wiggle.borrow());
    assert_eq!(cluster.tc.read().wiggling_pid, wiggling_pid);

    // Pressure clears: the same process resumes wiggling.
    cluster.shard_map.set_unhealthy_relocations(0);
    cluster
        .wait_for("wiggle resumed", |s| wiggling_addresses(s) > 0)
        .await;
    assert_eq!(cluster.tc.read().wiggling_pid, wiggling_pid);
}

#[tokio::test]
async fn disabling_the_wiggle_restores_the_team_set() {
    let servers = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("teams built", |s| {
            s.healthy_team_count > 0
                && s.unhealthy_servers == 0
                && s.servers.values().all(|r| !r.teams.is_empty())
        })
        .await;
    pin_shards(&cluster);

    let teams_before: Vec<Vec<Uid>> = {
        let state = cluster.tc.read();
        state.good_teams().map(|t| t.servers.clone()).collect()
    };

    cluster.meta.set(WIGGLE_KEY, "1").await.unwrap();
    cluster
        .wait_for("a process is wiggling", |s| wiggling_addresses(s) > 0)
        .await;

    cluster.meta.set(WIGGLE_KEY, "0").await.unwrap();
    cluster
        .wait_for("wiggle torn down", |s| {
            wiggling_addresses(s) == 0 && s.wiggling_pid.is_none()
        })
        .await;
    assert!(*cluster.tc.pause_wiggle.borrow());

    // Nothing drained, so the team set is exactly what it was.
    cluster
        .wait_for("servers healthy again", |s| s.unhealthy_servers == 0)
        .await;
    let teams_after: Vec<Vec<Uid>> = {
        let state = cluster.tc.read();
        state.good_teams().map(|t| t.servers.clone()).collect()
    };
    assert_eq!(teams_before, teams_after);
    cluster.tc.read().check_invariants(&cluster.tc.cfg).unwrap();
}
