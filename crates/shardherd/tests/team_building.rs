//! Team construction against a live collection: build-pass bounds, bad-team
//! subset promotion, and the exclude/un-exclude round trip.

mod common;

use common::*;
use shardherd::external::ShardAssignment;
use shardherd::types::KeyRange;

#[tokio::test]
async fn build_pass_on_six_zones_produces_bounded_teams() {
    let servers = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;

    cluster
        .wait_for("teams built", |s| s.good_teams().count() >= 10 && s.healthy_team_count > 0)
        .await;

    let state = cluster.tc.read();
    let teams = state.good_teams().count();
    assert!(teams <= 20, "built {teams} teams out of 20 possible");
    assert!(state.sanity_check_teams());
    let target = cluster.tc.cfg.target_teams_per_server();
    for record in state.servers.values() {
        assert!(!record.teams.is_empty(), "{} has no teams", record.id);
        assert!(record.teams.len() <= 2 * target);
    }
    state.check_invariants(&cluster.tc.cfg).unwrap();
}

#[tokio::test]
async fn bad_initial_team_promotes_policy_satisfying_subset() {
    // Four servers on distinct zones; the historical team references all
    // four, which violates the size invariant.
    let servers: Vec<_> = (0..4).map(|n| entry(n, &format!("z{n}"))).collect();
    let shards = vec![ShardAssignment {
        range: KeyRange::new(b"".to_vec(), b"\xff".to_vec()),
        primary_src: (0..4).map(uid).collect(),
        primary_dest: vec![],
        remote_src: vec![],
        remote_dest: vec![],
    }];
    let cluster = TestCluster::start_with(fast_config(), servers, shards, false).await;

    let state = cluster.tc.read();
    assert_eq!(state.bad_teams().count(), 1);
    let promoted: Vec<_> = state.good_teams().collect();
    assert_eq!(promoted.len(), 1, "expected exactly the promoted subset");
    assert_eq!(promoted[0].servers.len(), 3);
    assert!(promoted[0].servers.iter().all(|s| (0..4).map(uid).any(|u| u == *s)));
    state.check_invariants(&cluster.tc.cfg).unwrap();
}

#[tokio::test]
async fn bad_initial_team_without_policy_subset_adds_nothing() {
    // Only two distinct zones among four servers: no triple can satisfy
    // "across three zones".
    let servers = vec![
        entry(0, "zA"),
        entry(1, "zB"),
        entry_with(2, "zA", "p2", "dc1", "hallA"),
        entry_with(3, "zB", "p3", "dc1", "hallA"),
    ];
    let shards = vec![ShardAssignment {
        range: KeyRange::new(b"".to_vec(), b"\xff".to_vec()),
        primary_src: (0..4).map(uid).collect(),
        primary_dest: vec![],
        remote_src: vec![],
        remote_dest: vec![],
    }];
    let cluster = TestCluster::start_with(fast_config(), servers, shards, false).await;

    let state = cluster.tc.read();
    assert_eq!(state.good_teams().count(), 0);
    assert_eq!(state.bad_teams().count(), 1);
}

#[tokio::test]
async fn exclude_then_unexclude_restores_team_count() {
    let servers = (0..6).map(|n| entry(n, &format!("z{n}"))).collect();
    let cluster = TestCluster::start(fast_config(), servers).await;
    cluster
        .wait_for("initial build settled", |s| {
            s.good_teams().count() == 20 && s.unhealthy_servers == 0
        })
        .await;
    let before = cluster.tc.read().good_teams().count();

    // Operator-exclude one server: it drains (no shards) and is removed.
    cluster
        .meta
        .set_exclusions(vec![shardherd::types::AddressExclusion::endpoint(addr(0))], vec![]);
    cluster
        .wait_for("excluded server removed", |s| !s.servers.contains_key(&uid(0)))
        .await;

    // Un-exclude and offer a replacement worker on the same zone.
    cluster.meta.set_exclusions(vec![], vec![]);
    cluster.workers.offer_candidate(0, "dc1", "hallA");
    cluster
        .wait_for("replacement recruited", |s| s.servers.len() == 6)
        .await;
    cluster
        .wait_for("teams rebuilt", |s| s.good_teams().count() >= before)
        .await;

    let state = cluster.tc.read();
    assert_eq!(state.good_teams().count(), before);
    state.check_invariants(&cluster.tc.cfg).unwrap();
}
