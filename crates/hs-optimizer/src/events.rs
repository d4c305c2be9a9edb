//! Events emitted by the scheduler for external consumption (progress
//! display, dashboards, alerting).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hs_types::{ParameterSet, TrialId};

/// Why a trial was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The early termination policy judged it unpromising.
    EarlyTermination,
    /// The search exceeded `max_duration`.
    Timeout,
    /// Someone called [`crate::StopHandle::stop`].
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    SearchStarted {
        search_id: Uuid,
        name: String,
        planned_trials: usize,
    },
    /// The grid was larger than the trial budget; only the first `used`
    /// points will run.
    GridTruncated {
        available: usize,
        used: usize,
    },
    TrialStarted {
        trial_id: TrialId,
        parameters: ParameterSet,
    },
    MetricLogged {
        trial_id: TrialId,
        name: String,
        step: u64,
        value: f64,
    },
    TrialCompleted {
        trial_id: TrialId,
        value: Option<f64>,
    },
    TrialFailed {
        trial_id: TrialId,
        error: String,
    },
    TrialCancelled {
        trial_id: TrialId,
        reason: CancelReason,
    },
    MissingPrimaryMetric {
        trial_id: TrialId,
        metric: String,
    },
    NewBest {
        trial_id: TrialId,
        value: f64,
    },
    CancellationTimeout {
        trial_id: TrialId,
        grace_ms: u64,
    },
    SearchFinished {
        search_id: Uuid,
        completed: usize,
        failed: usize,
        cancelled: usize,
    },
}
