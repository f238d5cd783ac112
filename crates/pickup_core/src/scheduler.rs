//! Periodic batch matching runs.
//!
//! One run: fetch eligible flights, reconcile flights that already have a
//! committed ride, admit (geocode and validate), prefetch route legs, plan
//! groups, then persist. Runs never overlap; a tick that arrives while a run
//! is in flight is skipped. Each run is bounded by a wall-clock timeout and
//! retried with exponential backoff on retryable errors.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admission::{admit_batch, Admission};
use crate::audit::{AuditRecord, AuditSink};
use crate::cache::LookupCaches;
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use crate::matching::{CandidateGroup, Grouping, GroupingEngine, GroupingOutcome, Placement};
use crate::request::{FlightId, RawRequest, Request, RequestId, ValidationReport};
use crate::ride::CommittedGroup;
use crate::routing::Router;
use crate::services::{Geocoder, LookupGateway};
use crate::store::{EligibilityWindow, RideStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Matching,
    Persisting,
    Failed,
}

/// Metrics and results of one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: u64,
    /// Records returned by the store.
    pub eligible: usize,
    /// Flights dropped because a previous attempt already committed them.
    pub reconciled: usize,
    pub admitted: usize,
    pub rejected: Vec<ValidationReport>,
    pub committed: Vec<CommittedGroup>,
    pub unmatched: Vec<RequestId>,
    pub attempts: u32,
    /// Number of planned groups per group size.
    pub size_distribution: BTreeMap<usize, usize>,
}

impl RunReport {
    pub fn matched_requests(&self) -> usize {
        self.committed.iter().map(CommittedGroup::len).sum()
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(RunReport),
    /// A run was already in progress.
    Skipped,
    Failed(EngineError),
}

/// What a run would commit, without touching the store.
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    pub eligible: usize,
    pub admitted: Vec<Request>,
    pub rejected: Vec<ValidationReport>,
    pub outcome: GroupingOutcome,
}

pub struct BatchScheduler {
    config: EngineConfig,
    store: Arc<dyn RideStore>,
    gateway: LookupGateway,
    engine: GroupingEngine,
    audit: Arc<dyn AuditSink>,
    state: watch::Sender<RunState>,
    running: Mutex<()>,
    last_run_id: AtomicU64,
}

impl BatchScheduler {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RideStore>,
        geocoder: Arc<dyn Geocoder>,
        router: Arc<dyn Router>,
        caches: Arc<LookupCaches>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let engine = GroupingEngine::new(&config)?;
        let gateway = LookupGateway::new(
            geocoder,
            router,
            caches,
            config.service,
            config.scoring.assumed_speed_kmh,
        );
        let (state, _) = watch::channel(RunState::Idle);
        Ok(Self {
            config,
            store,
            gateway,
            engine,
            audit,
            state,
            running: Mutex::new(()),
            last_run_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn gateway(&self) -> &LookupGateway {
        &self.gateway
    }

    fn set_state(&self, state: RunState) {
        self.state.send_replace(state);
    }

    async fn audit(&self, record: AuditRecord) {
        if !self.config.scheduler.audit_enabled {
            return;
        }
        let limit = self.config.service.call_timeout();
        match tokio::time::timeout(limit, self.audit.record(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "audit record dropped"),
            Err(_) => warn!(?limit, "audit sink timed out, record dropped"),
        }
    }

    /// Execute one run for `now`, unless a run is already in progress.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Ok(_running) = self.running.try_lock() else {
            info!("previous run still in progress; tick skipped");
            return TickOutcome::Skipped;
        };
        let run_id = self.last_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let budget = self.config.scheduler.run_timeout();

        let outcome = match tokio::time::timeout(budget, self.run_with_retries(run_id, now)).await {
            Ok(Ok(report)) => TickOutcome::Completed(report),
            Ok(Err(err)) => TickOutcome::Failed(err),
            Err(_) => {
                let err = EngineError::Timeout(budget);
                error!(run_id, error = %err, "run abandoned");
                self.set_state(RunState::Failed);
                self.audit(AuditRecord::RunFailed {
                    run_id,
                    attempt: 0,
                    error: err.to_string(),
                    retryable: false,
                })
                .await;
                TickOutcome::Failed(err)
            }
        };
        self.set_state(RunState::Idle);
        outcome
    }

    async fn run_with_retries(
        &self,
        run_id: u64,
        now: DateTime<Utc>,
    ) -> Result<RunReport, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.audit(AuditRecord::RunStarted {
                run_id,
                attempt,
                at: now,
            })
            .await;

            match self.attempt(run_id, now).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    info!(
                        run_id,
                        attempt,
                        eligible = report.eligible,
                        admitted = report.admitted,
                        rejected = report.rejected.len(),
                        groups = report.committed.len(),
                        matched = report.matched_requests(),
                        unmatched = report.unmatched.len(),
                        "run complete"
                    );
                    self.audit(AuditRecord::RunFinished {
                        run_id,
                        attempts: attempt,
                        committed: report.committed.len(),
                        unmatched: report.unmatched.len(),
                    })
                    .await;
                    return Ok(report);
                }
                Err(err) => {
                    self.set_state(RunState::Failed);
                    let retry = err.is_retryable() && attempt <= self.config.scheduler.max_retries;
                    warn!(run_id, attempt, error = %err, retry, "run attempt failed");
                    self.audit(AuditRecord::RunFailed {
                        run_id,
                        attempt,
                        error: err.to_string(),
                        retryable: retry,
                    })
                    .await;
                    if !retry {
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.scheduler.backoff(attempt)).await;
                }
            }
        }
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<RawRequest>, EngineError> {
        let window = EligibilityWindow::starting_at(now, self.config.scheduler.lead_time());
        let raws = self
            .store
            .fetch_eligible(window, self.config.scheduler.batch_size)
            .await?;
        debug!(eligible = raws.len(), from = %window.from, to = %window.to, "fetched eligible flights");
        Ok(raws)
    }

    /// Drop records whose flight already has a committed ride. With `repair`
    /// set those flights are also marked matched, finishing a persist that
    /// was interrupted between commit and mark.
    async fn reconcile(
        &self,
        raws: Vec<RawRequest>,
        repair: bool,
    ) -> Result<(Vec<RawRequest>, usize), EngineError> {
        let flights: Vec<FlightId> = raws.iter().filter_map(|r| r.flight_id.map(FlightId)).collect();
        if flights.is_empty() {
            return Ok((raws, 0));
        }
        let done: HashSet<FlightId> = self
            .store
            .committed_rides(&flights)
            .await?
            .into_iter()
            .map(|(flight, _)| flight)
            .collect();
        if done.is_empty() {
            return Ok((raws, 0));
        }

        if repair {
            let mut repaired: Vec<FlightId> = done.iter().copied().collect();
            repaired.sort_unstable();
            info!(count = repaired.len(), "marking flights of already committed rides");
            self.store.mark_matched(&repaired).await?;
        }
        let remaining: Vec<RawRequest> = raws
            .into_iter()
            .filter(|r| !r.flight_id.is_some_and(|id| done.contains(&FlightId(id))))
            .collect();
        Ok((remaining, done.len()))
    }

    async fn admit_and_plan(
        &self,
        raws: Vec<RawRequest>,
    ) -> Result<(Admission, GroupingOutcome), EngineError> {
        let admission = admit_batch(raws, &self.gateway, &self.config.constraints).await?;
        let legs = self.engine.required_legs(&admission.admitted);
        let snapshot = self.gateway.prefetch_routes(legs).await?;
        let outcome = self.engine.plan(&admission.admitted, &snapshot);
        Ok((admission, outcome))
    }

    fn commits(&self, group: &CandidateGroup) -> bool {
        !group.is_singleton() || self.config.scheduler.commit_singletons
    }

    async fn attempt(&self, run_id: u64, now: DateTime<Utc>) -> Result<RunReport, EngineError> {
        self.set_state(RunState::Fetching);
        let raws = self.fetch(now).await?;
        let eligible = raws.len();
        let (raws, reconciled) = self.reconcile(raws, true).await?;

        self.set_state(RunState::Matching);
        let (admission, outcome) = self.admit_and_plan(raws).await?;
        for report in &admission.rejected {
            self.audit(AuditRecord::RequestRejected {
                run_id,
                flight_id: report.request_id,
                reason: report.error.to_string(),
            })
            .await;
        }
        for decision in &outcome.decisions {
            let (joined, score) = match decision.placement {
                Placement::Started => (false, None),
                Placement::Joined { score, .. } => (true, Some(score)),
            };
            self.audit(AuditRecord::ScoringDecision {
                run_id,
                flight_id: decision.request,
                group: decision.group,
                joined,
                score,
            })
            .await;
        }

        self.set_state(RunState::Persisting);
        let (to_commit, left): (Vec<&CandidateGroup>, Vec<&CandidateGroup>) =
            outcome.groups.iter().partition(|g| self.commits(g));
        let mut unmatched: Vec<RequestId> = left.iter().flat_map(|g| g.member_ids()).collect();
        let mut committed = Vec::with_capacity(to_commit.len());
        if !to_commit.is_empty() {
            let first = self.store.next_ride_id().await?;
            committed.extend(
                to_commit
                    .iter()
                    .enumerate()
                    .filter_map(|(i, group)| CommittedGroup::from_candidate(first.offset(i), group, now)),
            );
        }
        if !committed.is_empty() {
            self.store.commit_groups(&committed).await?;
            let flights: Vec<FlightId> = committed.iter().flat_map(|g| g.flight_ids()).collect();
            self.store.mark_matched(&flights).await?;
        }
        for ride in &committed {
            debug!(run_id, ride_id = %ride.ride_id, members = ride.len(), "ride committed");
            self.audit(AuditRecord::GroupCommitted {
                run_id,
                ride_id: ride.ride_id,
                flight_ids: ride.flight_ids().collect(),
                score: ride.score,
            })
            .await;
        }

        unmatched.sort_unstable();

        let mut size_distribution = BTreeMap::new();
        for group in &outcome.groups {
            *size_distribution.entry(group.len()).or_insert(0) += 1;
        }

        self.set_state(RunState::Idle);
        Ok(RunReport {
            run_id,
            eligible,
            reconciled,
            admitted: admission.admitted.len(),
            rejected: admission.rejected,
            committed,
            unmatched,
            attempts: 0,
            size_distribution,
        })
    }

    /// Plan a run for `now` without writing anything to the store.
    pub async fn dry_run(&self, now: DateTime<Utc>) -> Result<DryRunReport, EngineError> {
        let raws = self.fetch(now).await?;
        let eligible = raws.len();
        let (raws, _) = self.reconcile(raws, false).await?;
        let (admission, outcome) = self.admit_and_plan(raws).await?;
        Ok(DryRunReport {
            eligible,
            admitted: admission.admitted,
            rejected: admission.rejected,
            outcome,
        })
    }

    /// Tick every configured interval until `shutdown` flips to `true` or its
    /// sender is dropped. Each tick runs as its own task so a slow run makes
    /// the following ticks skip instead of queueing. In-flight runs are
    /// awaited before returning.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scheduler.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut runs = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduler = Arc::clone(&self);
                    runs.spawn(async move {
                        match scheduler.tick(Utc::now()).await {
                            TickOutcome::Failed(err) => error!(error = %err, "scheduled run failed"),
                            TickOutcome::Skipped => debug!("scheduled run skipped"),
                            TickOutcome::Completed(_) => {}
                        }
                    });
                }
                Some(_) = runs.join_next(), if !runs.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
        while runs.join_next().await.is_some() {}
    }
}
