//! The handle a training routine reports metrics through.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hs_types::{TrialCancelled, TrialId};

use crate::backend::CancelToken;
use crate::runner::TrialMessage;
use crate::store::ResultStore;

/// Metric channel for one trial.
///
/// Reports land in the result store immediately and are then forwarded to the
/// scheduler so the early termination policy can look at them. Once the trial
/// is cancelled every call returns `TrialCancelled`, which converts into a
/// trial execution error so routines can stop with `?`.
#[derive(Debug, Clone)]
pub struct MetricSink {
    trial_id: TrialId,
    store: Arc<ResultStore>,
    token: CancelToken,
    reports: Option<mpsc::UnboundedSender<TrialMessage>>,
}

impl MetricSink {
    pub fn new(trial_id: TrialId, store: Arc<ResultStore>, token: CancelToken) -> Self {
        Self {
            trial_id,
            store,
            token,
            reports: None,
        }
    }

    pub(crate) fn with_reports(mut self, reports: mpsc::UnboundedSender<TrialMessage>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Report `value` as the next checkpoint of `name`.
    pub fn log(&self, name: &str, value: f64) -> Result<(), TrialCancelled> {
        self.report(name, None, value)
    }

    /// Report `value` for `name` at an explicit step.
    pub fn log_at(&self, name: &str, step: u64, value: f64) -> Result<(), TrialCancelled> {
        self.report(name, Some(step), value)
    }

    fn report(&self, name: &str, step: Option<u64>, value: f64) -> Result<(), TrialCancelled> {
        let cancelled = TrialCancelled {
            trial_id: self.trial_id,
        };
        if self.token.is_cancelled() {
            return Err(cancelled);
        }
        if !value.is_finite() {
            warn!(trial_id = self.trial_id, metric = name, value, "ignoring non-finite metric");
            return Ok(());
        }

        match self.store.record_point(self.trial_id, name, step, value) {
            Ok(Some(point)) => {
                debug!(trial_id = self.trial_id, metric = name, step = point.step, value, "metric logged");
                if let Some(reports) = &self.reports {
                    // A closed channel means the scheduler has already returned.
                    let _ = reports.send(TrialMessage::Metric {
                        trial_id: self.trial_id,
                        point,
                    });
                }
                Ok(())
            }
            // The record left Running, so the scheduler cancelled it.
            Ok(None) => Err(cancelled),
            Err(e) => {
                warn!(trial_id = self.trial_id, error = %e, "dropping metric report");
                Ok(())
            }
        }
    }
}
