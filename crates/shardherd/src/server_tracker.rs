//! Per-server status tracking and the removal path.
//!
//! Each storage server (and TSS) gets one tracker task. It continuously
//! derives `{failed, undesired, wrong_configuration, wiggling}` from the
//! failure monitor, engine type, locality validity, address collisions, the
//! exclusion map, and version lag. An unhealthy server is removed only after
//! its shard count drains to zero and its added version has aged past the
//! read-transaction horizon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::collection::TeamCollection;
use crate::error::{DdError, Result};
use crate::external::HealthyZone;
use crate::types::{ExclusionStatus, Fitness, ServerStatus, Uid};

/// Outcome of one status evaluation, computed under the state lock.
struct Evaluation {
    status: ServerStatus,
    /// Server under a FAILED exclusion: hand off to the external removal
    /// path and fail the collection like a stolen move-keys lock.
    failed_exclusion: bool,
    /// Trackers of same-address peers that should re-check themselves.
    wake_peers: Vec<Arc<tokio::sync::Notify>>,
}

fn in_healthy_zone(zone: &Option<HealthyZone>, server_zone: Option<&str>) -> bool {
    match zone {
        Some(z) if z.ignores_all_failures() => true,
        Some(z) => server_zone == Some(z.zone_id.as_str()),
        None => false,
    }
}

fn evaluate(tc: &TeamCollection, id: Uid, is_tss: bool, monitor_failed: bool) -> Option<Evaluation> {
    let healthy_zone = tc.healthy_zone.borrow().clone();
    let mut state = tc.write();

    // Stale wiggle exclusions for other processes are reset here so the
    // address can be re-included once the sweep moves on.
    let wiggling_pid = state.wiggling_pid.clone();
    {
        let record = if is_tss { state.tss.get(&id) } else { state.servers.get(&id) }?;
        let process_id = record.locality.process_id().map(str::to_string);
        let stale: Vec<_> = record
            .exclusion_addresses()
            .into_iter()
            .filter(|addr| {
                state.excluded.get(addr) == Some(&ExclusionStatus::Wiggling)
                    && process_id.as_deref() != wiggling_pid.as_deref()
            })
            .collect();
        for addr in stale {
            state.excluded.remove(&addr);
        }
    }

    let record = if is_tss { state.tss.get(&id) } else { state.servers.get(&id) }?;
    let ignore_failures = healthy_zone
        .as_ref()
        .map_or(false, |z| z.ignores_all_failures());

    let mut status = ServerStatus::default();
    status.failed = monitor_failed
        && !in_healthy_zone(&healthy_zone, record.locality.zone_id());

    if record.version_too_far_behind && !ignore_failures {
        tracing::warn!(server = %id, "storage server version too far behind");
        status.undesired = true;
    }

    // Two servers on one address: the one with fewer shards gives way.
    let mut wake_peers = Vec::new();
    let my_shards = tc.deps.shard_map.shard_count(id);
    for other in state.servers_and_tss() {
        if other.id == id || other.endpoint != record.endpoint {
            continue;
        }
        if !state.status(other.id).is_unhealthy() {
            if tc.deps.shard_map.shard_count(other.id) >= my_shards {
                tracing::warn!(
                    server = %id,
                    other = %other.id,
                    address = %record.endpoint,
                    "address shared with a larger server"
                );
                status.undesired = true;
            } else {
                wake_peers.push(Arc::clone(&other.wake));
            }
        }
    }

    if record.process_class.storage_fitness() > Fitness::Neutral
        && state.optimal_team_count > 0
    {
        // Keep poorly-fitted processes only while nothing better exists.
        status.undesired = true;
    }

    let locality_valid = tc.cfg.policy.valid_locality(&record.locality);
    if !record.in_desired_dc || !locality_valid {
        tracing::warn!(
            server = %id,
            in_desired_dc = record.in_desired_dc,
            locality_valid,
            "server in wrong datacenter or with unusable locality"
        );
        status.undesired = true;
        status.wrong_configuration = true;
    }
    let endpoint_excl = crate::types::AddressExclusion::endpoint(record.endpoint);
    if locality_valid {
        state.invalid_locality_addrs.remove(&endpoint_excl);
    } else {
        state.invalid_locality_addrs.insert(endpoint_excl);
    }

    let record = if is_tss { state.tss.get(&id) } else { state.servers.get(&id) }?;
    if record.wrong_engine_to_remove {
        status.undesired = true;
        status.wrong_configuration = true;
    }

    let (worst, worst_addr) = state.worst_exclusion(record);
    let mut failed_exclusion = false;
    if worst != ExclusionStatus::None {
        tracing::debug!(server = %id, address = ?worst_addr, status = ?worst, "server excluded");
        status.undesired = true;
        status.wrong_configuration = true;
        if worst == ExclusionStatus::Wiggling && !is_tss {
            status.wiggling = true;
        }
        if worst == ExclusionStatus::Failed && !is_tss {
            failed_exclusion = true;
        }
    }

    state.set_server_status(id, status);
    Some(Evaluation { status, failed_exclusion, wake_peers })
}

pub async fn run(tc: Arc<TeamCollection>, id: Uid, is_tss: bool) {
    let (cancel, wake, kill_tss, mut removed_rx, endpoint, added_version, tss_pair) = {
        let state = tc.read();
        let Some(record) = state.server_or_tss(id) else {
            return;
        };
        (
            record.cancel.clone(),
            Arc::clone(&record.wake),
            Arc::clone(&record.kill_tss),
            record.removed_tx.subscribe(),
            record.endpoint,
            record.added_version,
            record.tss_pair_of,
        )
    };

    let mut availability = tc.deps.failure_monitor.availability(endpoint);
    let mut exclusion_epoch = tc.exclusion_epoch.subscribe();
    let mut healthy_zone = tc.healthy_zone.subscribe();
    let mut zero_optimal = tc.zero_optimal_teams();

    // Failure debounce: an endpoint must stay down for the reaction time
    // before the server counts as failed.
    let mut monitor_failed = false;
    let mut fail_deadline: Option<Instant> = None;
    let mut last_unhealthy = false;

    tracing::debug!(region = ?tc.region, server = %id, is_tss, "server tracker starting");

    loop {
        let available = *availability.borrow();
        if available {
            monitor_failed = false;
            fail_deadline = None;
        } else if !monitor_failed && fail_deadline.is_none() {
            fail_deadline = Some(Instant::now() + tc.cfg.failure_reaction_time);
        }

        let Some(eval) = evaluate(&tc, id, is_tss, monitor_failed) else {
            return;
        };
        for peer in eval.wake_peers {
            peer.notify_one();
        }
        if eval.failed_exclusion {
            tracing::warn!(region = ?tc.region, server = %id, "server marked failed; removing keys");
            tc.report_failed_server(id);
            tc.report_fatal(DdError::MoveKeysConflict);
            return;
        }
        if eval.status.failed {
            tc.restart_recruiting.notify_one();
            // A failure inside a maintenance zone ends the maintenance.
            let zone = tc.healthy_zone.borrow().clone();
            if let Some(zone) = zone {
                if !zone.ignores_all_failures() {
                    let _ = tc.deps.meta.set(crate::external::HEALTHY_ZONE_KEY, "").await;
                    let _ = tc.healthy_zone.send(None);
                    tracing::info!(region = ?tc.region, "maintenance zone cleared by failure");
                }
            }
        }

        if last_unhealthy && !eval.status.is_unhealthy() && !is_tss {
            let needs_teams = {
                let state = tc.read();
                state
                    .servers
                    .get(&id)
                    .map_or(false, |r| r.teams.len() < tc.cfg.target_teams_per_server())
                    || state.last_build_teams_failed
            };
            if needs_teams {
                tc.request_build();
            }
        }
        last_unhealthy = eval.status.is_unhealthy();

        // A TSS whose live pair disappeared removes itself.
        let pair_gone = is_tss
            && tss_pair.map_or(false, |pair| !tc.read().servers.contains_key(&pair));
        if pair_gone {
            remove_server_record(&tc, id, true).await;
            return;
        }

        let fail_timer = async {
            match fail_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let drain = async {
            if eval.status.is_unhealthy() {
                wait_for_all_data_removed(&tc, id, added_version).await
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(region = ?tc.region, server = %id, "server tracker stopping");
                return;
            }
            result = removed_rx.changed() => {
                if result.is_err() || *removed_rx.borrow() {
                    return;
                }
            }
            _ = availability.changed() => {}
            _ = fail_timer => {
                monitor_failed = true;
                fail_deadline = None;
                tracing::warn!(region = ?tc.region, server = %id, "storage server failed");
            }
            _ = exclusion_epoch.changed() => {}
            _ = healthy_zone.changed() => {}
            _ = zero_optimal.changed() => {}
            _ = wake.notified() => {}
            _ = kill_tss.notified(), if is_tss => {
                tracing::warn!(region = ?tc.region, server = %id, "killing test storage server");
                remove_server_record(&tc, id, true).await;
                return;
            }
            result = drain => {
                match result {
                    Ok(()) => {
                        // Failed and fully drained: the record can finally go.
                        remove_server_record(&tc, id, true).await;
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(server = %id, error = %err, "data-removal wait failed");
                        tokio::time::sleep(tc.cfg.all_data_removed_delay).await;
                    }
                }
            }
        }
    }
}

/// Block until no shard references the server and its added version has aged
/// out of the read-transaction window.
async fn wait_for_all_data_removed(tc: &TeamCollection, id: Uid, added_version: u64) -> Result<()> {
    loop {
        let version = tc.deps.meta.read_version().await?;
        // Removing a server too soon after adding it could race a master
        // recovery that still replays mutations to it.
        if version > added_version + tc.cfg.max_read_transaction_life_versions
            && tc.deps.shard_map.shard_count(id) == 0
        {
            return Ok(());
        }
        tokio::time::sleep(tc.cfg.all_data_removed_delay).await;
    }
}

/// Remove the server from the persistent server list (unless it is already
/// gone) and from the in-memory registries, cancelling dependent trackers.
async fn remove_server_record(tc: &TeamCollection, id: Uid, update_meta: bool) {
    if update_meta {
        let tss_pair = tc.read().tss_by_pair.get(&id).copied();
        loop {
            match tc.deps.meta.remove_server(id, tss_pair).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(server = %id, error = %err, "retrying server removal");
                    tokio::time::sleep(tc.cfg.storage_recruitment_delay).await;
                }
                Err(err) => {
                    tc.report_fatal(err);
                    return;
                }
            }
        }
    }
    let team_tokens = tc.write().remove_server(id);
    for token in team_tokens {
        token.cancel();
    }
    tracing::info!(region = ?tc.region, server = %id, "storage server removed");
    tc.request_build();
    tc.restart_recruiting.notify_one();
}

/// Periodic metrics refresh for one server; also derives the version-lag and
/// wrong-engine flags from what the server reports.
pub async fn metrics_polling(tc: Arc<TeamCollection>, id: Uid) {
    let (cancel, mut removed_rx) = {
        let state = tc.read();
        let Some(record) = state.server_or_tss(id) else {
            return;
        };
        (record.cancel.clone(), record.removed_tx.subscribe())
    };

    loop {
        match tc.deps.workers.server_metrics(id).await {
            Ok(metrics) => {
                let lag_flip = {
                    let version = tc.deps.meta.read_version().await.unwrap_or(0);
                    let lagging = version.saturating_sub(metrics.durable_version)
                        > tc.cfg.max_version_lag;
                    let mut state = tc.write();
                    let is_tss = state.tss.contains_key(&id);
                    let record = if is_tss {
                        state.tss.get_mut(&id)
                    } else {
                        state.servers.get_mut(&id)
                    };
                    match record {
                        Some(record) => {
                            record.metrics = Some(metrics);
                            let flip = record.version_too_far_behind != lagging;
                            record.version_too_far_behind = lagging;
                            flip.then(|| Arc::clone(&record.wake))
                        }
                        None => return,
                    }
                };
                if let Some(wake) = lag_flip {
                    wake.notify_one();
                }
            }
            Err(err) => {
                tracing::debug!(server = %id, error = %err, "metrics poll failed");
            }
        }

        match tc.deps.workers.engine_type(id).await {
            Ok(engine) => {
                let mut state = tc.write();
                let is_tss = state.tss.contains_key(&id);
                let expected = if is_tss { tc.cfg.tss_engine } else { tc.cfg.engine };
                let record = if is_tss {
                    state.tss.get_mut(&id)
                } else {
                    state.servers.get_mut(&id)
                };
                if let Some(record) = record {
                    record.engine = engine;
                    if !is_tss && engine != expected && !record.wrong_engine_to_remove {
                        // The wrong-engine remover decides when to act on it.
                        tracing::debug!(server = %id, ?engine, "engine differs from configuration");
                    }
                }
            }
            Err(err) => {
                tracing::debug!(server = %id, error = %err, "engine type poll failed");
            }
        }

        let jitter_ms = tc.with_rng(|rng| {
            rng.gen_range(0..=tc.cfg.metrics_polling_jitter.as_millis() as u64)
        });
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = removed_rx.changed() => {
                if result.is_err() || *removed_rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(tc.cfg.metrics_polling_delay + Duration::from_millis(jitter_ms)) => {}
        }
    }
}

/// Addresses currently excluded from recruitment because their locality
/// cannot satisfy the policy.
pub fn invalid_locality_addresses(tc: &TeamCollection) -> Vec<SocketAddr> {
    let state = tc.read();
    state
        .invalid_locality_addrs
        .iter()
        .filter_map(|a| a.port.map(|p| SocketAddr::new(a.ip, p)))
        .collect()
}
