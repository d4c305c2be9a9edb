//! The search scheduler: owns the run queue, enforces the concurrency and
//! budget limits, applies the early termination policy and tracks the best
//! trial.
//!
//! All queue promotion and cancellation decisions happen on a single loop.
//! Trials run as independent tasks and talk back to the loop over a channel:
//! metric reports (already written to the store) and final outcomes.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hs_types::{
    internal_error, HsError, HsResult, MetricPoint, SearchConfig, TrialId, TrialStatus,
};

use crate::backend::{CancelToken, ExecutionBackend, TrialJob};
use crate::events::{CancelReason, SearchEvent};
use crate::policy::{build_policy, EarlyTerminationPolicy, NeverCancel};
use crate::runner::{TrialMessage, TrialOutcome, TrialRunner};
use crate::sink::MetricSink;
use crate::space::ParameterSpace;
use crate::store::{BestResult, ResultStore, StatusCounts};

/// How a search came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcome {
    /// Every sampled trial reached a terminal state.
    Exhausted,
    /// `max_duration` elapsed.
    TimedOut,
    /// Stopped through a [`StopHandle`].
    Stopped,
}

/// Final report of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub search_id: Uuid,
    pub name: String,
    pub outcome: SearchOutcome,
    pub counts: StatusCounts,
    pub peak_concurrency: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub best: Option<BestResult>,
}

/// Stops a running search from the outside. Running trials are cancelled and
/// queued ones are dropped, exactly as when `max_duration` elapses.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Mutable state of one `run` call.
struct RunState {
    queue: VecDeque<TrialId>,
    running: HashMap<TrialId, CancelToken>,
    /// Cancelled trials whose task has not returned yet, with the end of
    /// their grace period.
    cancelling: HashMap<TrialId, Instant>,
    best: Option<(TrialId, f64)>,
    peak_concurrency: usize,
    outcome: SearchOutcome,
    draining: bool,
}

impl RunState {
    fn new(queue: VecDeque<TrialId>) -> Self {
        Self {
            queue,
            running: HashMap::new(),
            cancelling: HashMap::new(),
            best: None,
            peak_concurrency: 0,
            outcome: SearchOutcome::Exhausted,
            draining: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty() && self.cancelling.is_empty()
    }
}

enum Wake {
    Message(Option<TrialMessage>),
    Deadline,
    Stop,
    GraceExpired,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct SearchScheduler {
    search_id: Uuid,
    config: SearchConfig,
    space: ParameterSpace,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<ResultStore>,
    policy: Arc<dyn EarlyTerminationPolicy>,
    events: Option<Sender<SearchEvent>>,
    stop: StopHandle,
    started: AtomicBool,
}

impl SearchScheduler {
    /// Validate `config` and prepare a search. Nothing is dispatched until
    /// [`run`](Self::run).
    pub fn new(
        config: SearchConfig,
        space: ParameterSpace,
        backend: Arc<dyn ExecutionBackend>,
    ) -> HsResult<Self> {
        config.validate()?;
        let policy = match &config.policy {
            Some(policy) => build_policy(policy),
            None => Arc::new(NeverCancel),
        };

        Ok(Self {
            search_id: Uuid::new_v4(),
            config,
            space,
            backend,
            store: Arc::new(ResultStore::new()),
            policy,
            events: None,
            stop: StopHandle::default(),
            started: AtomicBool::new(false),
        })
    }

    /// Replace the configured policy with a custom one.
    pub fn with_policy(mut self, policy: Arc<dyn EarlyTerminationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Sender<SearchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn search_id(&self) -> Uuid {
        self.search_id
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<ResultStore> {
        Arc::clone(&self.store)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Best Completed trial so far.
    pub fn best_result(&self) -> HsResult<BestResult> {
        self.store.best(&self.config.objective())
    }

    /// Run the search until every trial is terminal, the time budget runs
    /// out or the search is stopped. A search runs at most once.
    pub async fn run(&self) -> HsResult<SearchSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(internal_error!("search {} has already run", self.search_id));
        }
        let started_at = Utc::now();
        let runner = TrialRunner::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            self.config.primary_metric.clone(),
        );

        let sampling = self.space.sample(self.config.max_total_trials);
        if let Some(truncation) = sampling.truncation {
            warn!(
                available = truncation.available,
                used = truncation.used,
                "grid is larger than the trial budget; running the first points only"
            );
            self.emit(SearchEvent::GridTruncated {
                available: truncation.available,
                used: truncation.used,
            });
        }

        let mut state = RunState::new(
            sampling
                .sets
                .into_iter()
                .map(|parameters| self.store.create(parameters))
                .collect(),
        );

        info!(
            search_id = %self.search_id,
            name = %self.config.name,
            trials = state.queue.len(),
            max_concurrent = self.config.max_concurrent_trials,
            policy = self.policy.name(),
            backend = self.backend.name(),
            "starting search"
        );
        self.emit(SearchEvent::SearchStarted {
            search_id: self.search_id,
            name: self.config.name.clone(),
            planned_trials: state.queue.len(),
        });

        let deadline = self.config.max_duration().map(|d| Instant::now() + d);
        let (tx, mut rx) = mpsc::unbounded_channel();

        loop {
            if !state.draining {
                if self.stop.is_stopped() {
                    self.shutdown(SearchOutcome::Stopped, &mut state)?;
                } else {
                    self.fill_slots(&runner, &tx, &mut state)?;
                }
            }
            if state.is_idle() {
                break;
            }

            let grace_deadline = state.cancelling.values().min().copied();
            let wake = tokio::select! {
                message = rx.recv() => Wake::Message(message),
                _ = sleep_until(deadline), if !state.draining => Wake::Deadline,
                _ = self.stop.stopped(), if !state.draining => Wake::Stop,
                _ = sleep_until(grace_deadline), if grace_deadline.is_some() => Wake::GraceExpired,
            };

            match wake {
                Wake::Message(Some(TrialMessage::Metric { trial_id, point })) => {
                    self.on_metric(trial_id, point, &mut state)?;
                }
                Wake::Message(Some(TrialMessage::Finished { trial_id, outcome })) => {
                    self.on_finished(trial_id, outcome?, &mut state);
                }
                Wake::Message(None) => {
                    return Err(internal_error!("trial channel closed while the search was running"));
                }
                Wake::Deadline => self.shutdown(SearchOutcome::TimedOut, &mut state)?,
                Wake::Stop => self.shutdown(SearchOutcome::Stopped, &mut state)?,
                Wake::GraceExpired => self.expire_grace(&mut state),
            }
        }

        let counts = self.store.status_counts();
        let best = self.best_result().ok();
        info!(
            search_id = %self.search_id,
            outcome = ?state.outcome,
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            best_trial = ?best.as_ref().map(|b| b.trial_id),
            "search finished"
        );
        self.emit(SearchEvent::SearchFinished {
            search_id: self.search_id,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
        });

        Ok(SearchSummary {
            search_id: self.search_id,
            name: self.config.name.clone(),
            outcome: state.outcome,
            counts,
            peak_concurrency: state.peak_concurrency,
            started_at,
            finished_at: Utc::now(),
            best,
        })
    }

    fn fill_slots(
        &self,
        runner: &TrialRunner,
        tx: &mpsc::UnboundedSender<TrialMessage>,
        state: &mut RunState,
    ) -> HsResult<()> {
        while state.running.len() < self.config.max_concurrent_trials {
            let Some(trial_id) = state.queue.pop_front() else {
                break;
            };
            self.store.update_status(trial_id, TrialStatus::Running)?;
            let parameters = self.store.get(trial_id)?.parameters;

            let token = CancelToken::new();
            let sink = MetricSink::new(trial_id, Arc::clone(&self.store), token.clone())
                .with_reports(tx.clone());
            let job = TrialJob {
                trial_id,
                parameters: parameters.clone(),
                sink,
            };

            let runner = runner.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = runner.execute(job).await;
                let _ = tx.send(TrialMessage::Finished { trial_id, outcome });
            });

            state.running.insert(trial_id, token);
            state.peak_concurrency = state.peak_concurrency.max(state.running.len());
            info!(trial_id, parameters = %parameters, "trial started");
            self.emit(SearchEvent::TrialStarted {
                trial_id,
                parameters,
            });
        }
        Ok(())
    }

    fn on_metric(&self, trial_id: TrialId, point: MetricPoint, state: &mut RunState) -> HsResult<()> {
        self.emit(SearchEvent::MetricLogged {
            trial_id,
            name: point.name.clone(),
            step: point.step,
            value: point.value,
        });
        if point.name != self.config.primary_metric || !state.running.contains_key(&trial_id) {
            return Ok(());
        }

        let all = self.store.all();
        let Some(trial) = all.iter().find(|record| record.id == trial_id) else {
            return Err(HsError::TrialNotFound { trial_id });
        };
        if trial.status != TrialStatus::Running {
            return Ok(());
        }
        if self
            .policy
            .should_cancel(trial, point.step, &all, &self.config.objective())
        {
            info!(
                trial_id,
                step = point.step,
                value = point.value,
                policy = self.policy.name(),
                "early termination"
            );
            self.cancel_trial(trial_id, CancelReason::EarlyTermination, state)?;
        }
        Ok(())
    }

    fn on_finished(&self, trial_id: TrialId, outcome: TrialOutcome, state: &mut RunState) {
        state.running.remove(&trial_id);
        let within_grace = state.cancelling.remove(&trial_id).is_some();

        match outcome.status {
            TrialStatus::Completed => {
                if outcome.missing_primary {
                    self.emit(SearchEvent::MissingPrimaryMetric {
                        trial_id,
                        metric: self.config.primary_metric.clone(),
                    });
                }
                self.emit(SearchEvent::TrialCompleted {
                    trial_id,
                    value: outcome.primary_value,
                });
                if let Some(value) = outcome.primary_value {
                    self.track_best(trial_id, value, state);
                }
            }
            TrialStatus::Failed => {
                self.emit(SearchEvent::TrialFailed {
                    trial_id,
                    error: outcome.error.unwrap_or_default(),
                });
            }
            _ if within_grace => debug!(trial_id, "cancellation acknowledged"),
            _ => debug!(trial_id, "cancelled trial returned after its grace period"),
        }
    }

    fn track_best(&self, trial_id: TrialId, value: f64, state: &mut RunState) {
        let direction = self.config.goal;
        let improved = match state.best {
            None => true,
            Some((best_id, best_value)) => {
                direction.is_better(value, best_value) || (value == best_value && trial_id < best_id)
            }
        };
        if improved {
            state.best = Some((trial_id, value));
            info!(trial_id, metric = %self.config.primary_metric, value, "new best trial");
            self.emit(SearchEvent::NewBest { trial_id, value });
        }
    }

    fn cancel_trial(&self, trial_id: TrialId, reason: CancelReason, state: &mut RunState) -> HsResult<()> {
        let Some(token) = state.running.remove(&trial_id) else {
            return Ok(());
        };
        // The trial may have finished with its outcome still in the channel.
        if !self.store.cancel_if_active(trial_id)? {
            return Ok(());
        }

        self.backend.cancel(trial_id, &token);
        state
            .cancelling
            .insert(trial_id, Instant::now() + self.config.cancellation_grace());
        info!(trial_id, reason = ?reason, "trial cancelled");
        self.emit(SearchEvent::TrialCancelled { trial_id, reason });
        Ok(())
    }

    fn shutdown(&self, outcome: SearchOutcome, state: &mut RunState) -> HsResult<()> {
        let reason = match outcome {
            SearchOutcome::TimedOut => CancelReason::Timeout,
            _ => CancelReason::Stopped,
        };
        state.outcome = outcome;
        state.draining = true;
        info!(
            outcome = ?outcome,
            running = state.running.len(),
            queued = state.queue.len(),
            "stopping search"
        );

        while let Some(trial_id) = state.queue.pop_front() {
            if self.store.cancel_if_active(trial_id)? {
                self.emit(SearchEvent::TrialCancelled { trial_id, reason });
            }
        }
        let running: Vec<TrialId> = state.running.keys().copied().collect();
        for trial_id in running {
            self.cancel_trial(trial_id, reason, state)?;
        }
        Ok(())
    }

    fn expire_grace(&self, state: &mut RunState) {
        let now = Instant::now();
        let expired: Vec<TrialId> = state
            .cancelling
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(trial_id, _)| *trial_id)
            .collect();

        let grace_ms = self.config.cancellation_grace_ms;
        for trial_id in expired {
            state.cancelling.remove(&trial_id);
            let error = HsError::CancellationTimeout { trial_id, grace_ms };
            warn!(trial_id, error = %error, "treating trial as stopped; its resources may leak");
            self.emit(SearchEvent::CancellationTimeout { trial_id, grace_ms });
        }
    }

    fn emit(&self, event: SearchEvent) {
        if let Some(events) = &self.events {
            // Best-effort; a full or dropped receiver must not stall the search.
            let _ = events.try_send(event);
        }
    }
}
