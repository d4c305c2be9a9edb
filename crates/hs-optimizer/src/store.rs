//! Append-only, in-memory record of every trial in a search.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use hs_types::{
    ArtifactRef, HsError, HsResult, MetricPoint, Objective, ParameterSet, TrialId, TrialRecord,
    TrialStatus,
};

/// Number of trials in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// The winning trial, handed to whatever registers the model afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub trial_id: TrialId,
    pub parameters: ParameterSet,
    pub metric: String,
    pub value: f64,
    pub metrics: HashMap<String, f64>,
    pub artifact: Option<ArtifactRef>,
}

/// Trial records keyed by id, each behind its own lock so trials can be
/// updated in parallel while writes to one trial stay serialized.
#[derive(Debug, Default)]
pub struct ResultStore {
    records: DashMap<TrialId, Mutex<TrialRecord>>,
    next_id: AtomicU64,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a Queued record and return its id.
    pub fn create(&self, parameters: ParameterSet) -> TrialId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records
            .insert(id, Mutex::new(TrialRecord::new(id, parameters)));
        id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn with_record<T>(&self, id: TrialId, f: impl FnOnce(&mut TrialRecord) -> T) -> HsResult<T> {
        let entry = self
            .records
            .get(&id)
            .ok_or(HsError::TrialNotFound { trial_id: id })?;
        let mut record = entry.lock();
        Ok(f(&mut record))
    }

    /// Snapshot of one record.
    pub fn get(&self, id: TrialId) -> HsResult<TrialRecord> {
        self.with_record(id, |record| record.clone())
    }

    /// Snapshot of every record, ordered by trial id.
    pub fn all(&self) -> Vec<TrialRecord> {
        let upper = self.next_id.load(Ordering::SeqCst);
        (0..upper)
            .filter_map(|id| self.records.get(&id).map(|entry| entry.lock().clone()))
            .collect()
    }

    /// Set the latest value of a metric. Repeating a write is a no-op; a
    /// different value replaces the old one.
    pub fn update_metrics(&self, id: TrialId, name: &str, value: f64) -> HsResult<()> {
        self.with_record(id, |record| record.set_metric(name, value))
    }

    /// Append a metric report to a Running trial. Reports for trials in any
    /// other state are dropped and `None` is returned. Without an explicit
    /// step the report becomes the next checkpoint for that metric.
    pub fn record_point(
        &self,
        id: TrialId,
        name: &str,
        step: Option<u64>,
        value: f64,
    ) -> HsResult<Option<MetricPoint>> {
        self.with_record(id, |record| {
            if record.status != TrialStatus::Running {
                return None;
            }
            let step = step.unwrap_or_else(|| record.latest_step(name) + 1);
            let point = MetricPoint {
                name: name.to_string(),
                step,
                value,
                logged_at: Utc::now(),
            };
            record.push_point(point.clone());
            Some(point)
        })
    }

    /// Apply a state machine transition. Illegal transitions fail with
    /// `InvalidTransition` and leave the record unchanged.
    pub fn update_status(&self, id: TrialId, status: TrialStatus) -> HsResult<()> {
        self.with_record(id, |record| record.transition(status))?
    }

    /// Cancel a trial that has not finished yet. Returns `false` when the
    /// trial already reached a terminal state.
    pub fn cancel_if_active(&self, id: TrialId) -> HsResult<bool> {
        self.with_record(id, |record| {
            if record.status.is_terminal() {
                return Ok(false);
            }
            record.transition(TrialStatus::Cancelled).map(|_| true)
        })?
    }

    /// Write the final status of a trial that ran to completion or failed.
    /// Returns `false` without touching the record if the trial was
    /// cancelled in the meantime.
    pub fn finalize(
        &self,
        id: TrialId,
        status: TrialStatus,
        error: Option<String>,
        artifact: Option<ArtifactRef>,
    ) -> HsResult<bool> {
        self.with_record(id, |record| {
            if record.status == TrialStatus::Cancelled {
                return Ok(false);
            }
            record.transition(status)?;
            record.error = error;
            record.artifact = artifact;
            Ok(true)
        })?
    }

    pub fn add_warning(&self, id: TrialId, warning: impl Into<String>) -> HsResult<()> {
        self.with_record(id, |record| record.warnings.push(warning.into()))
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.records.iter() {
            match entry.value().lock().status {
                TrialStatus::Queued => counts.queued += 1,
                TrialStatus::Running => counts.running += 1,
                TrialStatus::Completed => counts.completed += 1,
                TrialStatus::Failed => counts.failed += 1,
                TrialStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Completed trials that reported the objective metric, best first.
    /// Ties keep the earlier trial id first.
    pub fn ranked(&self, objective: &Objective) -> Vec<TrialRecord> {
        let mut ranked: Vec<(f64, TrialRecord)> = self
            .all()
            .into_iter()
            .filter(|record| record.status == TrialStatus::Completed)
            .filter_map(|record| record.metric(&objective.metric).map(|v| (v, record)))
            .filter(|(value, _)| !value.is_nan())
            .collect();

        ranked.sort_by(|(a_value, a), (b_value, b)| {
            let by_value = if objective.direction.is_better(*a_value, *b_value) {
                std::cmp::Ordering::Less
            } else if objective.direction.is_better(*b_value, *a_value) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            };
            by_value.then(a.id.cmp(&b.id))
        });

        ranked.into_iter().map(|(_, record)| record).collect()
    }

    /// The best Completed trial for `objective`.
    pub fn best(&self, objective: &Objective) -> HsResult<BestResult> {
        let record = self
            .ranked(objective)
            .into_iter()
            .next()
            .ok_or_else(|| HsError::NoSuccessfulTrial {
                metric: objective.metric.clone(),
            })?;
        let value = record
            .metric(&objective.metric)
            .ok_or_else(|| HsError::Internal("ranked trial lost its metric".to_string()))?;

        Ok(BestResult {
            trial_id: record.id,
            parameters: record.parameters,
            metric: objective.metric.clone(),
            value,
            metrics: record.metrics,
            artifact: record.artifact,
        })
    }
}
