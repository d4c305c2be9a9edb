//! Trial records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ObjectiveDirection;
use crate::errors::{HsError, HsResult};
use crate::parameters::ParameterSet;

/// Trial identifier. Assigned from 0 in sampling order and never reused.
pub type TrialId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal edges of the trial state machine. A queued trial may be
    /// cancelled without ever running (search timeout or stop).
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// A single metric report. `step` counts reports of the same metric name
/// within one trial, starting at 1, and is what aligns checkpoints across
/// trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub step: u64,
    pub value: f64,
    pub logged_at: DateTime<Utc>,
}

/// Handle to whatever a trial produced (model directory, checkpoint URI, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything known about one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub parameters: ParameterSet,
    pub status: TrialStatus,
    /// Latest value per metric name.
    pub metrics: HashMap<String, f64>,
    /// Every accepted report in arrival order.
    pub history: Vec<MetricPoint>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub artifact: Option<ArtifactRef>,
}

impl TrialRecord {
    pub fn new(id: TrialId, parameters: ParameterSet) -> Self {
        Self {
            id,
            parameters,
            status: TrialStatus::Queued,
            metrics: HashMap::new(),
            history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            warnings: Vec::new(),
            artifact: None,
        }
    }

    /// Move to `next`, stamping start/end times. Illegal edges leave the
    /// record untouched.
    pub fn transition(&mut self, next: TrialStatus) -> HsResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(HsError::InvalidTransition {
                trial_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            TrialStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Set the latest value for `name` without touching the history.
    pub fn set_metric(&mut self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), value);
    }

    pub fn push_point(&mut self, point: MetricPoint) {
        self.metrics.insert(point.name.clone(), point.value);
        self.history.push(point);
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Number of reports of `name` so far.
    pub fn latest_step(&self, name: &str) -> u64 {
        self.history
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.step)
            .max()
            .unwrap_or(0)
    }

    /// Values of `name` reported at or before checkpoint `step`.
    pub fn values_up_to<'a>(&'a self, name: &'a str, step: u64) -> impl Iterator<Item = f64> + 'a {
        self.history
            .iter()
            .filter(move |p| p.name == name && p.step <= step)
            .map(|p| p.value)
    }

    /// Best value of `name` at or before `step` under `direction`.
    pub fn best_up_to(&self, name: &str, step: u64, direction: ObjectiveDirection) -> Option<f64> {
        self.values_up_to(name, step)
            .reduce(|best, v| if direction.is_better(v, best) { v } else { best })
    }

    /// Mean of `name` at or before `step`.
    pub fn average_up_to(&self, name: &str, step: u64) -> Option<f64> {
        let (sum, count) = self
            .values_up_to(name, step)
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}
