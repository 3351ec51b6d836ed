//! Failure handling: priority escalation as a team loses members, and the
//! drain-then-age gate on server removal.

mod common;

use std::time::Duration;

use common::*;
use shardherd::types::{priority, AddressExclusion, KeyRange, Uid};

#[tokio::test]
async fn member_failures_escalate_relocation_priority() {
    let servers = (0..9).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("teams built", |s| s.healthy_team_count > 0 && s.unhealthy_servers == 0)
        .await;

    // The doomed team plus a guaranteed-healthy disjoint team, so the
    // collection never reports zero healthy teams.
    let doomed: Vec<Uid> = {
        let state = cluster.tc.read();
        let doomed = state
            .good_teams()
            .next()
            .expect("at least one team")
            .servers
            .clone();
        doomed
    };
    let spare: Vec<Uid> = (0..9)
        .map(uid)
        .filter(|u| !doomed.contains(u))
        .take(3)
        .collect();
    cluster.tc.register_team(spare, false, false);

    let range = KeyRange::new(b"m".to_vec(), b"n".to_vec());
    cluster.shard_map.assign(range.clone(), doomed.clone(), true, 4_096);

    // Let the initial failure-reaction grace period elapse.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.take_relocations();

    cluster.failure.set_available(addr(doomed[0].0), false);
    cluster.failure.set_available(addr(doomed[1].0), false);
    let relocation = cluster.wait_for_relocation(priority::TEAM_1_LEFT).await;
    assert_eq!(relocation.keys, range);

    cluster.failure.set_available(addr(doomed[2].0), false);
    let relocation = cluster.wait_for_relocation(priority::TEAM_0_LEFT).await;
    assert_eq!(relocation.keys, range);

    // Reviving one member de-escalates below total loss.
    cluster.failure.set_available(addr(doomed[0].0), true);
    cluster.wait_for_relocation(priority::TEAM_1_LEFT).await;
}

#[tokio::test]
async fn removal_blocks_on_drain_and_version_age() {
    // Server 0 joined recently: its added version is far ahead of the
    // current read version.
    let mut servers: Vec<_> = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    servers[0].added_version = 5_000;
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("teams built", |s| {
            s.healthy_team_count > 0
                && s.unhealthy_servers == 0
                && s.servers.get(&uid(0)).map_or(false, |r| !r.teams.is_empty())
        })
        .await;

    let team_with_zero: Vec<Uid> = {
        let state = cluster.tc.read();
        let team_id = state.servers[&uid(0)].teams[0];
        state.server_teams[&team_id].servers.clone()
    };
    let range = KeyRange::new(b"a".to_vec(), b"b".to_vec());
    cluster.shard_map.assign(range, team_with_zero, true, 1_024);

    cluster
        .meta
        .set_exclusions(vec![AddressExclusion::endpoint(addr(0))], vec![]);
    cluster
        .wait_for("server undesired", |s| s.status(uid(0)).undesired)
        .await;

    // Still holding a shard: the record must survive.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.tc.read().servers.contains_key(&uid(0)));

    // Drained, but the added version has not aged out yet.
    cluster.shard_map.drain_server(uid(0));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.tc.read().servers.contains_key(&uid(0)));
    assert!(cluster.meta.removed_servers().is_empty());

    // Version passes added + horizon: removal completes.
    cluster.meta.advance_version(5_000);
    cluster
        .wait_for("server removed", |s| !s.servers.contains_key(&uid(0)))
        .await;
    assert_eq!(cluster.meta.removed_servers(), vec![uid(0)]);

    let state = cluster.tc.read();
    assert!(state.good_teams().all(|t| !t.servers.contains(&uid(0))));
    assert!(state.recruiting_ids.is_empty());
    state.check_invariants(&cluster.tc.cfg).unwrap();
}

#[tokio::test]
async fn failed_exclusion_hands_server_to_external_removal() {
    let servers = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("teams built", |s| s.healthy_team_count > 0)
        .await;

    cluster
        .meta
        .set_exclusions(vec![], vec![AddressExclusion::endpoint(addr(3))]);

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        cluster.failed_servers.lock().unwrap().recv().await
    })
    .await
    .expect("failed-server signal in time")
    .expect("channel open");
    assert_eq!(failed, uid(3));
    // A FAILED exclusion tears the collection down like a stolen move-keys
    // lock; the distributor restarts it.
    cluster
        .wait_for("collection failing", |_| {
            cluster.tc.fatal_error() == Some(shardherd::DdError::MoveKeysConflict)
        })
        .await;
}
