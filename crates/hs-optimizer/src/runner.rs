//! Executes one trial through a backend and records how it ended.

use std::sync::Arc;
use tracing::{info, warn};

use hs_types::{
    ArtifactRef, HsResult, MetricPoint, TrialExecutionError, TrialId, TrialStatus,
};

use crate::backend::{ExecutionBackend, ExecutionResult, TrialJob};
use crate::store::ResultStore;

/// Messages from trial tasks back to the scheduler loop.
#[derive(Debug)]
pub(crate) enum TrialMessage {
    Metric {
        trial_id: TrialId,
        point: MetricPoint,
    },
    Finished {
        trial_id: TrialId,
        outcome: HsResult<TrialOutcome>,
    },
}

/// How a trial ended, as recorded in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub trial_id: TrialId,
    pub status: TrialStatus,
    pub error: Option<String>,
    pub artifact: Option<ArtifactRef>,
    /// Final value of the primary metric, if the trial reported one.
    pub primary_value: Option<f64>,
    /// Set when a Completed trial never reported the primary metric.
    pub missing_primary: bool,
}

/// Runs trials on a backend and writes their final state to the store.
#[derive(Clone)]
pub struct TrialRunner {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<ResultStore>,
    primary_metric: String,
}

impl TrialRunner {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<ResultStore>,
        primary_metric: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            primary_metric: primary_metric.into(),
        }
    }

    /// Run `job` to completion. The trial must already be Running.
    ///
    /// Routine errors, panics and lost environments all end as a Failed
    /// trial; only store inconsistencies are returned as errors. If the
    /// scheduler cancelled the trial while it ran, the cancellation stands
    /// and the routine's result is discarded.
    pub async fn execute(&self, job: TrialJob) -> HsResult<TrialOutcome> {
        let trial_id = job.trial_id;
        let result = match self.backend.submit(job).await {
            Ok(handle) => self.backend.wait(handle).await,
            Err(e) => Err(TrialExecutionError::EnvironmentLost {
                message: e.to_string(),
            }),
        };
        self.record(trial_id, result)
    }

    fn record(&self, trial_id: TrialId, result: ExecutionResult) -> HsResult<TrialOutcome> {
        let (status, error, artifact) = match result {
            Ok(output) => (TrialStatus::Completed, None, output.artifact),
            Err(e) => (TrialStatus::Failed, Some(e.to_string()), None),
        };

        let written = self
            .store
            .finalize(trial_id, status, error.clone(), artifact.clone())?;
        let record = self.store.get(trial_id)?;
        let primary_value = record.metric(&self.primary_metric);

        if !written {
            info!(trial_id, "trial finished after cancellation");
            return Ok(TrialOutcome {
                trial_id,
                status: TrialStatus::Cancelled,
                error: None,
                artifact: None,
                primary_value,
                missing_primary: false,
            });
        }

        let missing_primary = status == TrialStatus::Completed && primary_value.is_none();
        match status {
            TrialStatus::Completed => {
                info!(
                    trial_id,
                    metric = %self.primary_metric,
                    value = ?primary_value,
                    duration_s = ?record.duration_seconds(),
                    "trial completed"
                );
            }
            _ => {
                warn!(trial_id, error = ?error, "trial failed");
            }
        }
        if missing_primary {
            warn!(trial_id, metric = %self.primary_metric, "trial completed without reporting the primary metric");
            self.store.add_warning(
                trial_id,
                format!("primary metric '{}' was never reported", self.primary_metric),
            )?;
        }

        Ok(TrialOutcome {
            trial_id,
            status,
            error,
            artifact,
            primary_value,
            missing_primary,
        })
    }
}
