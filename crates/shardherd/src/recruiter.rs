//! Storage-server recruitment.
//!
//! The recruiter keeps one candidate request outstanding against the
//! cluster controller, excluding addresses that already host two servers,
//! addresses with a recruit in flight, anything in the exclusion map, and
//! addresses with unusable locality. A request is *critical* while no
//! healthy team exists.
//!
//! TSS recruitment runs as a two-phase pair: phase A starts the TSS half,
//! which blocks until the paired live server reports its id and version;
//! phase B recruits that live server on the next candidate in the same
//! dc + data hall. Either half failing resolves the other so neither side
//! is ever stuck, and cancellation completes both.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, watch};

use crate::collection::TeamCollection;
use crate::error::DdError;
use crate::external::{CandidateWorker, InitializeStorageRequest, RecruitStorageRequest};
use crate::locality::Locality;
use crate::types::{AddressExclusion, Uid};

/// State of one in-flight TSS pair recruitment.
pub struct TssPairState {
    /// dc + data hall the pair must share; `None` marks the inactive state.
    zone: Option<(Option<String>, Option<String>)>,
    inner: StdMutex<PairChannels>,
    complete_tx: watch::Sender<bool>,
}

struct PairChannels {
    ss_tx: Option<oneshot::Sender<Option<(Uid, u64)>>>,
    ss_rx: Option<oneshot::Receiver<Option<(Uid, u64)>>>,
    tss_tx: Option<oneshot::Sender<bool>>,
    tss_rx: Option<oneshot::Receiver<bool>>,
}

impl TssPairState {
    pub fn inactive() -> Arc<Self> {
        Arc::new(TssPairState {
            zone: None,
            inner: StdMutex::new(PairChannels {
                ss_tx: None,
                ss_rx: None,
                tss_tx: None,
                tss_rx: None,
            }),
            complete_tx: watch::channel(false).0,
        })
    }

    pub fn active(locality: &Locality) -> Arc<Self> {
        let (ss_tx, ss_rx) = oneshot::channel();
        let (tss_tx, tss_rx) = oneshot::channel();
        Arc::new(TssPairState {
            zone: Some((
                locality.dc_id().map(str::to_string),
                locality.data_hall_id().map(str::to_string),
            )),
            inner: StdMutex::new(PairChannels {
                ss_tx: Some(ss_tx),
                ss_rx: Some(ss_rx),
                tss_tx: Some(tss_tx),
                tss_rx: Some(tss_rx),
            }),
            complete_tx: watch::channel(false).0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.zone.is_some()
    }

    pub fn in_data_zone(&self, locality: &Locality) -> bool {
        match &self.zone {
            Some((dc, hall)) => {
                locality.dc_id() == dc.as_deref() && locality.data_hall_id() == hall.as_deref()
            }
            None => false,
        }
    }

    fn ss_recruit_success(&self, info: (Uid, u64)) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.ss_tx.take() {
            Some(tx) => tx.send(Some(info)).is_ok(),
            None => false,
        }
    }

    fn ss_recruit_failed(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.ss_tx.take() {
            Some(tx) => {
                let _ = tx.send(None);
                true
            }
            None => false,
        }
    }

    fn tss_recruit_success(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.tss_tx.take() {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    fn tss_recruit_failed(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.tss_tx.take() {
            Some(tx) => {
                let _ = tx.send(false);
                true
            }
            None => false,
        }
    }

    /// Resolve both halves so neither is stuck. Only acts when neither half
    /// has resolved yet; a half-finished pair must run to completion.
    pub fn cancel(&self) {
        if !self.is_active() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.ss_tx.is_some() && inner.tss_tx.is_some() {
            if let Some(tx) = inner.ss_tx.take() {
                let _ = tx.send(None);
            }
            if let Some(tx) = inner.tss_tx.take() {
                let _ = tx.send(false);
            }
            let _ = self.complete_tx.send(true);
        }
    }

    fn mark_complete(&self) {
        let _ = self.complete_tx.send(true);
    }

    fn take_ss_rx(&self) -> Option<oneshot::Receiver<Option<(Uid, u64)>>> {
        self.inner.lock().unwrap().ss_rx.take()
    }

    fn take_tss_rx(&self) -> Option<oneshot::Receiver<bool>> {
        self.inner.lock().unwrap().tss_rx.take()
    }

    pub fn subscribe_complete(&self) -> watch::Receiver<bool> {
        self.complete_tx.subscribe()
    }
}

/// Exclusion list for a recruitment request.
fn build_request(tc: &TeamCollection, critical: bool) -> RecruitStorageRequest {
    let state = tc.read();
    let mut exclusions: std::collections::BTreeSet<AddressExclusion> = std::collections::BTreeSet::new();
    for record in state.servers_and_tss() {
        if state
            .status_initialized(record.id)
            .then(|| state.status(record.id))
            .map_or(true, |s| s.exclude_on_recruit())
        {
            exclusions.insert(AddressExclusion::endpoint(record.endpoint));
        }
    }
    for addr in &state.recruiting_localities {
        exclusions.insert(AddressExclusion::endpoint(*addr));
    }
    for (addr, status) in &state.excluded {
        if *status != crate::types::ExclusionStatus::None {
            exclusions.insert(*addr);
        }
    }
    for addr in &state.invalid_locality_addrs {
        exclusions.insert(*addr);
    }
    RecruitStorageRequest {
        excluded: exclusions.into_iter().collect(),
        include_dcs: Vec::new(),
        critical,
    }
}

pub async fn storage_recruiter(tc: Arc<TeamCollection>) {
    let mut zero_healthy = tc.zero_healthy_teams();
    let mut exclusion_epoch = tc.exclusion_epoch.subscribe();
    let mut pair_state = TssPairState::inactive();
    let mut tss_to_recruit: i64 = 0;
    let mut tss_in_progress: Vec<watch::Receiver<bool>> = Vec::new();
    let mut pending_tss_check = false;
    let mut check_tss_at: Option<tokio::time::Instant> = None;
    let mut candidate_fut: Option<BoxFuture<'static, crate::error::Result<CandidateWorker>>> = None;
    let mut last_request: Option<RecruitStorageRequest> = None;
    let mut was_recruiting = false;

    loop {
        tss_in_progress.retain(|rx| !*rx.borrow());

        // TSS are spread across regions; the primary absorbs the remainder.
        let mut target_tss = tc.cfg.desired_tss_count as i64;
        if tc.cfg.usable_regions > 1 {
            target_tss /= tc.cfg.usable_regions as i64;
            if tc.region.is_primary() {
                target_tss += (tc.cfg.desired_tss_count % tc.cfg.usable_regions) as i64;
            }
        }
        let (existing_tss, is_tss_recruiting) = {
            let state = tc.read();
            (state.tss.len() as i64, state.is_tss_recruiting)
        };
        let new_to_recruit = target_tss - existing_tss - tss_in_progress.len() as i64;
        if new_to_recruit != tss_to_recruit {
            tracing::info!(
                region = ?tc.region,
                desired = target_tss,
                existing = existing_tss,
                in_progress = tss_in_progress.len(),
                not_started = new_to_recruit,
                "tss recruitment target updated"
            );
            tss_to_recruit = new_to_recruit;
            if !pending_tss_check
                && (tss_to_recruit < 0 || *zero_healthy.borrow())
                && (is_tss_recruiting || (*zero_healthy.borrow() && existing_tss > 0))
            {
                check_tss_at = Some(tokio::time::Instant::now());
            }
        }

        let critical = *zero_healthy.borrow();
        let request = build_request(&tc, critical);
        if critical {
            tracing::warn!(region = ?tc.region, "critical storage recruitment");
        }
        let recruiting_now = {
            let state = tc.read();
            !state.recruiting_ids.is_empty() || state.is_tss_recruiting
        };
        if recruiting_now != was_recruiting {
            was_recruiting = recruiting_now;
            tracing::info!(
                region = ?tc.region,
                state = if recruiting_now { "recruiting" } else { "idle" },
                "storage server recruitment"
            );
        }

        if candidate_fut.is_none() || last_request.as_ref() != Some(&request) {
            tracing::debug!(
                region = ?tc.region,
                exclusions = request.excluded.len(),
                critical = request.critical,
                "requesting storage candidate"
            );
            last_request = Some(request.clone());
            let workers = Arc::clone(&tc.deps.workers);
            candidate_fut = Some(Box::pin(async move { workers.recruit_storage(request).await }));
        }

        let check_timer = async {
            match check_tss_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            candidate = candidate_fut.as_mut().expect("future installed") => {
                candidate_fut = None;
                match candidate {
                    Ok(candidate) => {
                        handle_candidate(
                            &tc,
                            candidate,
                            &mut pair_state,
                            tss_to_recruit,
                            &mut tss_in_progress,
                            &mut check_tss_at,
                        );
                    }
                    Err(err) if err.is_retryable() => {
                        tokio::time::sleep(tc.cfg.storage_recruitment_delay).await;
                    }
                    Err(err) => {
                        tc.report_fatal(err);
                        return;
                    }
                }
            }
            result = zero_healthy.changed() => {
                if result.is_err() {
                    return;
                }
                let (tss_count, is_recruiting) = {
                    let state = tc.read();
                    (state.tss.len(), state.is_tss_recruiting)
                };
                if !pending_tss_check
                    && *zero_healthy.borrow()
                    && (is_recruiting || tss_count > 0)
                {
                    check_tss_at = Some(tokio::time::Instant::now());
                }
            }
            _ = exclusion_epoch.changed() => {}
            _ = tc.restart_recruiting.notified() => {}
            _ = check_timer => {
                check_tss(
                    &tc,
                    &mut pair_state,
                    tss_to_recruit,
                    &mut pending_tss_check,
                    &mut check_tss_at,
                );
            }
        }
        // Brief pause so bursty wakeups cannot spin the request loop.
        tokio::time::sleep(tc.cfg.stall_check_delay / 4).await;
    }
}

fn handle_candidate(
    tc: &Arc<TeamCollection>,
    candidate: CandidateWorker,
    pair_state: &mut Arc<TssPairState>,
    tss_to_recruit: i64,
    tss_in_progress: &mut Vec<watch::Receiver<bool>>,
    check_tss_at: &mut Option<tokio::time::Instant>,
) {
    let existing_on_addr = {
        let state = tc.read();
        state
            .servers_and_tss()
            .filter(|r| r.endpoint == candidate.endpoint)
            .count()
    };
    if existing_on_addr >= 2 {
        tracing::warn!(
            region = ?tc.region,
            address = %candidate.endpoint,
            existing = existing_on_addr,
            "candidate address already hosts too many storage servers"
        );
    }

    let has_healthy_team = { tc.read().healthy_team_count != 0 };

    if has_healthy_team && !pair_state.is_active() && tss_to_recruit > 0 {
        tracing::info!(
            region = ?tc.region,
            address = %candidate.endpoint,
            "starting tss pair recruitment"
        );
        tc.write().is_tss_recruiting = true;
        let pair = TssPairState::active(&candidate.locality);
        *pair_state = Arc::clone(&pair);
        tss_in_progress.push(pair.subscribe_complete());
        let tc2 = Arc::clone(tc);
        tc.spawn(async move {
            initialize_storage(tc2, candidate, true, pair).await;
        });
        *check_tss_at = Some(tokio::time::Instant::now() + tc.cfg.tss_check_interval);
    } else if pair_state.is_active() && pair_state.in_data_zone(&candidate.locality) {
        tracing::info!(
            region = ?tc.region,
            address = %candidate.endpoint,
            "pairing storage server with waiting tss"
        );
        tc.write().is_tss_recruiting = false;
        let pair = std::mem::replace(pair_state, TssPairState::inactive());
        let tc2 = Arc::clone(tc);
        tc.spawn(async move {
            initialize_storage(tc2, candidate, false, pair).await;
        });
    } else {
        let pair = TssPairState::inactive();
        let tc2 = Arc::clone(tc);
        tc.spawn(async move {
            initialize_storage(tc2, candidate, false, pair).await;
        });
    }
}

/// Periodic TSS re-check: cancel a waiting pair or kill surplus TSS.
fn check_tss(
    tc: &Arc<TeamCollection>,
    pair_state: &mut Arc<TssPairState>,
    tss_to_recruit: i64,
    pending: &mut bool,
    check_tss_at: &mut Option<tokio::time::Instant>,
) {
    let zero_healthy = *tc.zero_healthy_teams().borrow();
    let (is_recruiting, tss_count) = {
        let state = tc.read();
        (state.is_tss_recruiting, state.tss.len() as i64)
    };
    let cancel_pair = is_recruiting && (tss_to_recruit < 0 || zero_healthy);
    let tss_to_kill = tss_count.min((-tss_to_recruit).max(if zero_healthy { 1 } else { 0 }));

    if cancel_pair {
        tracing::warn!(
            region = ?tc.region,
            reason = if tss_to_recruit <= 0 { "too_many" } else { "zero_healthy_teams" },
            "cancelling tss pair recruitment"
        );
        pair_state.cancel();
        *pair_state = TssPairState::inactive();
        tc.write().is_tss_recruiting = false;
        *pending = true;
        *check_tss_at = Some(tokio::time::Instant::now() + tc.cfg.tss_check_interval);
    } else if tss_to_kill > 0 {
        let victims: Vec<_> = {
            let state = tc.read();
            state
                .tss
                .values()
                .take(tss_to_kill as usize)
                .map(|r| (r.id, Arc::clone(&r.kill_tss)))
                .collect()
        };
        for (id, kill) in victims {
            tracing::warn!(
                region = ?tc.region,
                tss = %id,
                reason = if zero_healthy { "zero_healthy_teams" } else { "too_many" },
                "killing tss"
            );
            kill.notify_one();
        }
        // Give the replacement servers time to join teams before killing
        // another batch.
        *pending = true;
        *check_tss_at = Some(tokio::time::Instant::now() + tc.cfg.tss_check_interval);
    } else if is_recruiting {
        *pending = true;
        *check_tss_at = Some(tokio::time::Instant::now() + tc.cfg.tss_check_interval);
    } else {
        *pending = false;
        *check_tss_at = None;
    }
}

/// Negotiate one storage server (or TSS) on a candidate worker.
async fn initialize_storage(
    tc: Arc<TeamCollection>,
    candidate: CandidateWorker,
    recruit_tss: bool,
    pair: Arc<TssPairState>,
) {
    let addr = candidate.endpoint;
    let interface_id = tc.with_rng(|rng| Uid::random(rng));
    {
        let mut state = tc.write();
        let existing = state
            .servers_and_tss()
            .filter(|r| r.endpoint == addr)
            .count();
        // Two servers per address is the ceiling, and a pending recruit on
        // the address must finish first.
        if existing >= 2 || state.recruiting_localities.contains(&addr) {
            drop(state);
            if recruit_tss {
                pair.tss_recruit_failed();
                pair.mark_complete();
            } else {
                pair.ss_recruit_failed();
            }
            tc.restart_recruiting.notify_one();
            return;
        }
        state.recruiting_ids.insert(interface_id);
        state.recruiting_localities.insert(addr);
    }

    // The TSS half waits for its live pair before contacting the worker.
    let mut do_recruit = true;
    let mut tss_pair_info: Option<(Uid, u64)> = None;
    if recruit_tss {
        tracing::info!(region = ?tc.region, tss = %interface_id, address = %addr, "tss waiting for pair");
        let paired = match pair.take_ss_rx() {
            Some(rx) => rx.await.ok().flatten(),
            None => None,
        };
        match paired {
            Some(info) => {
                tracing::info!(
                    region = ?tc.region,
                    tss = %interface_id,
                    pair = %info.0,
                    added_version = info.1,
                    "tss pair resolved"
                );
                tss_pair_info = Some(info);
            }
            None => {
                tracing::warn!(region = ?tc.region, tss = %interface_id, "ss half of tss pair failed");
                do_recruit = false;
            }
        }
    }

    let request = InitializeStorageRequest {
        engine: if recruit_tss { tc.cfg.tss_engine } else { tc.cfg.engine },
        interface_id,
        tss_pair: tss_pair_info,
    };
    tracing::info!(
        region = ?tc.region,
        worker = %candidate.worker_id,
        address = %addr,
        interface = %interface_id,
        tss = recruit_tss,
        "sending initialize-storage request"
    );

    let result = if do_recruit {
        tc.deps.workers.initialize_storage(&candidate, request).await
    } else {
        Err(DdError::RecruitmentFailed)
    };

    if do_recruit {
        if let Err(err) = &result {
            tracing::warn!(region = ?tc.region, address = %addr, error = %err, "recruitment error");
            if !err.is_retryable() {
                pair.mark_complete();
                cleanup_recruiting(&tc, interface_id, addr);
                tc.report_fatal(err.clone());
                return;
            }
            tokio::time::sleep(tc.cfg.storage_recruitment_delay).await;
        }
    }

    if !recruit_tss {
        if let Ok(entry) = &result {
            if pair.ss_recruit_success((entry.id, entry.added_version)) {
                // Hold off registration until the TSS half lands or times
                // out, so the pair id is already known to the registry.
                tracing::info!(region = ?tc.region, ss = %entry.id, "ss signalling tss pair");
                let tss_done = pair.take_tss_rx();
                let outcome = match tss_done {
                    Some(rx) => {
                        tokio::time::timeout(tc.cfg.tss_recruitment_timeout, rx).await.ok()
                    }
                    None => None,
                };
                match outcome {
                    Some(Ok(true)) => {
                        tracing::info!(region = ?tc.region, ss = %entry.id, "tss pair recruited");
                    }
                    Some(Ok(false)) | Some(Err(_)) => {
                        tracing::warn!(region = ?tc.region, ss = %entry.id, "tss pair failed");
                    }
                    None => {
                        tracing::warn!(region = ?tc.region, ss = %entry.id, "tss pair timed out");
                    }
                }
            }
        }
    }

    cleanup_recruiting(&tc, interface_id, addr);

    if let Ok(entry) = result {
        let already_known = { tc.read().server_or_tss(entry.id).is_some() };
        if already_known {
            tracing::warn!(region = ?tc.region, server = %entry.id, "server id already recruited");
        } else if !recruit_tss || pair.tss_recruit_success() {
            tc.register_server(entry);
            pair.mark_complete();
        }
        if !recruit_tss {
            tc.request_build();
        }
    }

    // Settle whatever half of the pair is still waiting.
    if recruit_tss && pair.tss_recruit_failed() {
        pair.mark_complete();
    }
    if !recruit_tss {
        pair.ss_recruit_failed();
    }
    tc.restart_recruiting.notify_one();
}

fn cleanup_recruiting(tc: &TeamCollection, interface_id: Uid, addr: std::net::SocketAddr) {
    let mut state = tc.write();
    state.recruiting_ids.remove(&interface_id);
    state.recruiting_localities.remove(&addr);
}
