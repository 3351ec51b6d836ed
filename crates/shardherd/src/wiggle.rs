//! Perpetual storage wiggle: a one-process-at-a-time rolling replacement
//! used to migrate storage engines without losing replication.
//!
//! Three cooperating tasks while the watched enable key holds `"1"`:
//! - the *iterator* walks process ids in order, writing the next id to the
//!   per-region wiggling-process key after each finished step (resting while
//!   the cluster is too small to absorb a wiggle),
//! - the *wiggler* watches that key, marks every server of the named process
//!   `WIGGLING` in the exclusion map so the team trackers drain them, waits
//!   for the records to disappear, re-includes the addresses, and signals
//!   the iterator,
//! - the *health guard* pauses the wiggle when the move queue is busy with
//!   unhealthy relocations, when too few healthy teams remain, or when team
//!   selection reports being stuck; the spare-team requirement grows on each
//!   pause so the wiggle cannot oscillate.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::collection::TeamCollection;
use crate::external::{WIGGLE_KEY, WIGGLING_PID_KEY};
use crate::types::{AddressExclusion, ExclusionStatus};

fn wiggling_pid_key(tc: &TeamCollection) -> String {
    format!("{}{}", WIGGLING_PID_KEY, tc.region.key_suffix())
}

/// Watches the enable key and runs or stops the wiggle accordingly.
pub async fn monitor_perpetual_wiggle(tc: Arc<TeamCollection>) {
    let mut enable_watch = tc.deps.meta.subscribe(WIGGLE_KEY);
    let mut stop_tx: Option<watch::Sender<bool>> = None;
    let mut running: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        let enabled = enable_watch.borrow().as_deref() == Some("1");
        if enabled && stop_tx.is_none() {
            tracing::info!(region = ?tc.region, "perpetual storage wiggle enabled");
            let (tx, stop_rx) = watch::channel(false);
            let (finish_tx, finish_rx) = mpsc::unbounded_channel();
            let extra_teams = Arc::new(AtomicI64::new(0));

            let tc2 = Arc::clone(&tc);
            let stop2 = stop_rx.clone();
            running.push(tokio::spawn(async move {
                wiggle_iterator(tc2, stop2, finish_rx).await;
            }));
            let tc2 = Arc::clone(&tc);
            let stop2 = stop_rx.clone();
            let extra2 = Arc::clone(&extra_teams);
            running.push(tokio::spawn(async move {
                wiggler(tc2, stop2, finish_tx, extra2).await;
            }));
            let tc2 = Arc::clone(&tc);
            let extra2 = Arc::clone(&extra_teams);
            running.push(tokio::spawn(async move {
                wiggle_health_check(tc2, stop_rx, extra2).await;
            }));
            stop_tx = Some(tx);
        } else if !enabled {
            if let Some(tx) = stop_tx.take() {
                tracing::info!(region = ?tc.region, "perpetual storage wiggle disabled");
                let _ = tx.send(true);
                for handle in running.drain(..) {
                    let _ = handle.await;
                }
                let _ = tc.pause_wiggle.send(true);
            }
        }

        tokio::select! {
            _ = tc.cancel.cancelled() => {
                if let Some(tx) = stop_tx.take() {
                    let _ = tx.send(true);
                }
                for handle in running.drain(..) {
                    let _ = handle.await;
                }
                return;
            }
            result = enable_watch.changed() => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

/// Advance the per-region wiggling-process key to the successor of its
/// current value in process-id order (wrapping), or clear it when no
/// storage processes exist.
async fn update_next_wiggling_pid(tc: &TeamCollection) {
    let key = wiggling_pid_key(tc);
    let current = tc.deps.meta.get(&key).await.ok().flatten();
    let next = {
        let state = tc.read();
        if state.pid_servers.is_empty() {
            String::new()
        } else {
            let first = state.pid_servers.keys().next().expect("non-empty").clone();
            match current {
                Some(pid) => state
                    .pid_servers
                    .range::<String, _>((
                        std::ops::Bound::Excluded(pid),
                        std::ops::Bound::Unbounded,
                    ))
                    .next()
                    .map(|(k, _)| k.clone())
                    .unwrap_or(first),
                None => first,
            }
        }
    };
    if let Err(err) = tc.deps.meta.set(&key, &next).await {
        tracing::warn!(error = %err, "failed to advance wiggling process id");
        return;
    }
    tracing::debug!(region = ?tc.region, next_pid = %next, "advanced wiggling process id");
}

/// Writes the next process id after each finished wiggle, resting while the
/// cluster has no slack to absorb one.
async fn wiggle_iterator(
    tc: Arc<TeamCollection>,
    mut stop: watch::Receiver<bool>,
    mut finished: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {}
            _ = tc.cancel.cancelled() => return,
            Some(()) = finished.recv() => {
                loop {
                    let jitter = tc.with_rng(|rng| rng.gen_range(0.0..1.0));
                    let delay = tc.cfg.perpetual_wiggle_delay.mul_f64(0.5 + jitter);
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tc.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Without spare teams there is nowhere to drain to.
                    let take_rest = {
                        let state = tc.read();
                        state.servers.len() <= tc.cfg.team_size
                            || state.machines.len() < tc.cfg.team_size
                    };
                    tc.request_build();
                    if !take_rest {
                        break;
                    }
                    tracing::warn!(region = ?tc.region, "wiggle resting: cluster too small");
                }
                if !*stop.borrow() {
                    update_next_wiggling_pid(&tc).await;
                }
            }
        }
        if *stop.borrow() {
            return;
        }
    }
}

/// Mark the named process's servers WIGGLING; returns removal watches.
fn exclude_for_wiggle(tc: &TeamCollection, pid: &str) -> Vec<watch::Receiver<bool>> {
    let mut receivers = Vec::new();
    {
        let mut state = tc.write();
        let ids = state.pid_servers.get(pid).cloned().unwrap_or_default();
        for id in ids {
            let Some(record) = state.servers.get(&id) else {
                continue;
            };
            let addr = AddressExclusion::endpoint(record.endpoint);
            // Leave operator exclusions untouched.
            if state
                .excluded
                .get(&addr)
                .map_or(false, |s| *s != ExclusionStatus::None)
            {
                continue;
            }
            receivers.push(record.removed_tx.subscribe());
            state.wiggle_addresses.push(addr);
            state.excluded.insert(addr, ExclusionStatus::Wiggling);
        }
    }
    if !receivers.is_empty() {
        tc.restart_recruiting.notify_one();
    }
    tc.exclusion_epoch.send_modify(|e| *e += 1);
    receivers
}

/// Reset every wiggle exclusion back to NONE so the addresses can be
/// recruited again.
fn include_back(tc: &TeamCollection) {
    let mut included = false;
    {
        let mut state = tc.write();
        let addresses = std::mem::take(&mut state.wiggle_addresses);
        for addr in addresses {
            if state.excluded.get(&addr) == Some(&ExclusionStatus::Wiggling) {
                state.excluded.remove(&addr);
                included = true;
            }
        }
    }
    tc.exclusion_epoch.send_modify(|e| *e += 1);
    if included {
        tc.restart_recruiting.notify_one();
    }
}

async fn wiggler(
    tc: Arc<TeamCollection>,
    mut stop: watch::Receiver<bool>,
    finish_tx: mpsc::UnboundedSender<()>,
    extra_teams: Arc<AtomicI64>,
) {
    let key = wiggling_pid_key(&tc);
    let mut pid_watch = tc.deps.meta.subscribe(&key);
    let mut pause = tc.pause_wiggle.subscribe();

    // Only one process wiggles at a time per region. An absent key reads as
    // the empty pid, which drains nothing and immediately signals the
    // iterator to write the first real pid.
    let mut active_pid: Option<String> = {
        let initial = pid_watch.borrow().clone().unwrap_or_default();
        let mut state = tc.write();
        debug_assert!(state.wiggling_pid.is_none());
        state.wiggling_pid = Some(initial.clone());
        Some(initial)
    };
    let mut excluded = false;
    let mut move_finish: Option<BoxFuture<'static, ()>> = None;

    loop {
        if let Some(pid) = active_pid.clone() {
            if *pause.borrow() {
                if excluded || move_finish.is_some() {
                    move_finish = None;
                    include_back(&tc);
                    excluded = false;
                    tc.request_build();
                    let (healthy, stuck) = {
                        let state = tc.read();
                        (state.healthy_team_count, state.best_team_stuck_count)
                    };
                    tracing::warn!(
                        region = ?tc.region,
                        process_id = %pid,
                        healthy_teams = healthy,
                        best_team_stuck = stuck,
                        extra_teams = extra_teams.load(Ordering::Relaxed),
                        "perpetual storage wiggle paused"
                    );
                }
            } else if !excluded {
                let receivers = exclude_for_wiggle(&tc, &pid);
                excluded = true;
                let moving = receivers.len();
                move_finish = Some(Box::pin(async move {
                    for mut rx in receivers {
                        let _ = rx.wait_for(|removed| *removed).await;
                    }
                }));
                tracing::info!(
                    region = ?tc.region,
                    process_id = %pid,
                    servers = moving,
                    "perpetual storage wiggle started"
                );
            }
        }

        let drained = async {
            match move_finish.as_mut() {
                Some(f) => f.await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tc.cancel.cancelled() => break,
            _ = stop.changed() => {}
            _ = pause.changed() => {}
            result = pid_watch.changed(), if active_pid.is_none() => {
                if result.is_err() {
                    break;
                }
                let next = pid_watch.borrow().clone().unwrap_or_default();
                tc.write().wiggling_pid = Some(next.clone());
                active_pid = Some(next);
                let span = (tc.cfg.perpetual_wiggle_delay.as_millis() as u64 / 12).max(1);
                let jitter_ms = tc.with_rng(|rng| rng.gen_range(0..span));
                tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
            }
            _ = drained => {
                let pid = active_pid.take().unwrap_or_default();
                move_finish = None;
                include_back(&tc);
                excluded = false;
                tc.write().wiggling_pid = None;
                tracing::info!(
                    region = ?tc.region,
                    process_id = %pid,
                    "perpetual storage wiggle finished process"
                );
                let _ = finish_tx.send(());
                let previous = extra_teams.load(Ordering::Relaxed);
                extra_teams.store((previous - 1).max(0), Ordering::Relaxed);
            }
        }

        if *stop.borrow() {
            break;
        }
    }

    if tc.read().wiggling_pid.is_some() {
        include_back(&tc);
        tc.write().wiggling_pid = None;
        tracing::info!(region = ?tc.region, "wiggle exiting; servers re-included");
    }
}

/// Pauses the wiggle while the cluster cannot afford it.
async fn wiggle_health_check(
    tc: Arc<TeamCollection>,
    mut stop: watch::Receiver<bool>,
    extra_teams: Arc<AtomicI64>,
) {
    let mut pause_penalty = 1i64;
    loop {
        let queue_busy = tc.deps.shard_map.unhealthy_relocations();
        let (healthy, stuck, team_count) = {
            let state = tc.read();
            (
                state.healthy_team_count,
                state.best_team_stuck_count,
                state.good_teams().count() as i64,
            )
        };
        let extra = extra_teams.load(Ordering::Relaxed);
        let pause = queue_busy >= tc.cfg.wiggle_pause_threshold
            || healthy <= extra
            || stuck > tc.cfg.wiggle_stuck_threshold as u64;
        if pause {
            // Pauses not caused by queue pressure raise the spare-team bar,
            // damping pause/resume oscillation.
            let scarce = healthy <= extra || stuck > tc.cfg.wiggle_pause_threshold as u64;
            if scarce && !*tc.pause_wiggle.borrow() {
                extra_teams.store((extra + pause_penalty).min(team_count), Ordering::Relaxed);
                pause_penalty = (pause_penalty * 2).min(team_count.max(1));
            }
            let _ = tc.pause_wiggle.send(true);
        } else {
            let _ = tc.pause_wiggle.send(false);
        }

        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            result = stop.changed() => {
                if result.is_err() || *stop.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(tc.cfg.check_team_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TeamCollectionConfig;
    use crate::state::test_support::seed_server_on_process;
    use crate::state::CollectionState;

    #[test]
    fn successor_walk_wraps_over_process_ids() {
        let cfg = TeamCollectionConfig::triple();
        let mut state = CollectionState::new(&cfg);
        for (n, pid) in [(0, "pa"), (1, "pb"), (2, "pc")] {
            seed_server_on_process(&mut state, n, &format!("z{n}"), pid);
        }
        let next_after = |state: &CollectionState, current: Option<&str>| -> String {
            let first = state.pid_servers.keys().next().unwrap().clone();
            match current {
                Some(pid) => state
                    .pid_servers
                    .range::<String, _>((
                        std::ops::Bound::Excluded(pid.to_string()),
                        std::ops::Bound::Unbounded,
                    ))
                    .next()
                    .map(|(k, _)| k.clone())
                    .unwrap_or(first),
                None => first,
            }
        };
        assert_eq!(next_after(&state, None), "pa");
        assert_eq!(next_after(&state, Some("pa")), "pb");
        assert_eq!(next_after(&state, Some("pc")), "pa");
    }
}
