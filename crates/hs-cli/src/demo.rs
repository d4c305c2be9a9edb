//! Synthetic training routine for trying out search settings without a real
//! model. AUC improves with stronger regularization and with every epoch.

use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use hs_optimizer::{ExecutionResult, MetricSink, TrainingRoutine, TrialOutput};
use hs_types::{ParameterSet, TrialExecutionError};

pub struct SyntheticRoutine {
    epochs: u64,
    epoch_delay: Duration,
    output_root: PathBuf,
}

impl SyntheticRoutine {
    pub fn new(epochs: u64, epoch_delay: Duration, output_root: impl Into<PathBuf>) -> Self {
        Self {
            epochs: epochs.max(1),
            epoch_delay,
            output_root: output_root.into(),
        }
    }
}

/// AUC the model converges to for a given regularization strength.
fn converged_auc(regularization: f64) -> f64 {
    let strength = regularization.max(1e-6).log10().clamp(-4.0, 1.0) + 4.0;
    0.75 + 0.02 * strength
}

impl TrainingRoutine for SyntheticRoutine {
    fn run(&self, parameters: &ParameterSet, sink: &MetricSink) -> ExecutionResult {
        let regularization = parameters
            .get_f64("regularization")
            .ok_or_else(|| TrialExecutionError::routine("missing numeric 'regularization'"))?;
        let target = converged_auc(regularization);

        let mut auc = 0.5;
        for epoch in 1..=self.epochs {
            std::thread::sleep(self.epoch_delay);
            auc = target - (target - 0.5) * 0.5f64.powi(epoch as i32);
            sink.log("AUC", auc)?;
            sink.log("loss", 1.0 - auc)?;
        }

        let dir = self.output_root.join(format!("trial-{}", sink.trial_id()));
        let model = dir.join("model.json");
        let body = json!({
            "trial_id": sink.trial_id(),
            "parameters": parameters,
            "auc": auc,
        });
        std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(&model, body.to_string()))
            .map_err(|e| TrialExecutionError::routine(format!("writing model: {e}")))?;

        Ok(TrialOutput::with_artifact(model.display().to_string()))
    }
}
