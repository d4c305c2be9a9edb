//! Execution backend abstraction and the in-process implementation.

use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use hs_types::{
    ArtifactRef, HsResult, ParameterSet, TrialExecutionError, TrialId,
};

use crate::sink::MetricSink;

/// What a training routine hands back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialOutput {
    /// Path or URI of whatever the trial produced.
    pub artifact: Option<ArtifactRef>,
}

impl TrialOutput {
    pub fn with_artifact(artifact: impl Into<String>) -> Self {
        Self {
            artifact: Some(ArtifactRef(artifact.into())),
        }
    }
}

pub type ExecutionResult = Result<TrialOutput, TrialExecutionError>;

/// The unit of work being tuned. Invoked once per trial, possibly from many
/// threads at once.
pub trait TrainingRoutine: Send + Sync + 'static {
    fn run(&self, parameters: &ParameterSet, sink: &MetricSink) -> ExecutionResult;
}

impl<F> TrainingRoutine for F
where
    F: Fn(&ParameterSet, &MetricSink) -> ExecutionResult + Send + Sync + 'static,
{
    fn run(&self, parameters: &ParameterSet, sink: &MetricSink) -> ExecutionResult {
        self(parameters, sink)
    }
}

/// Cooperative cancellation flag shared between the scheduler and a running
/// trial.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a backend needs to run one trial.
#[derive(Debug, Clone)]
pub struct TrialJob {
    pub trial_id: TrialId,
    pub parameters: ParameterSet,
    pub sink: MetricSink,
}

impl TrialJob {
    pub fn token(&self) -> &CancelToken {
        self.sink.token()
    }
}

/// A submitted trial whose result has not been collected yet.
#[derive(Debug)]
pub struct TrialHandle {
    pub trial_id: TrialId,
    completion: oneshot::Receiver<ExecutionResult>,
}

impl TrialHandle {
    /// Pair a trial with the channel its backend will report on.
    pub fn new(trial_id: TrialId, completion: oneshot::Receiver<ExecutionResult>) -> Self {
        Self {
            trial_id,
            completion,
        }
    }
}

/// Places trial executions onto compute.
///
/// Implementations may run routines on local threads, in child processes or
/// on remote workers; the scheduler only needs submit, wait and a
/// best-effort cancel.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start running `job`.
    async fn submit(&self, job: TrialJob) -> HsResult<TrialHandle>;

    /// Wait for a submitted trial to finish. A backend that drops the
    /// completion channel has lost the trial's execution environment.
    async fn wait(&self, handle: TrialHandle) -> ExecutionResult {
        let trial_id = handle.trial_id;
        handle.completion.await.unwrap_or_else(|_| {
            Err(TrialExecutionError::EnvironmentLost {
                message: format!("trial {trial_id} completion channel closed"),
            })
        })
    }

    /// Ask a running trial to stop. Best effort; must not block.
    fn cancel(&self, trial_id: TrialId, token: &CancelToken) {
        debug!(trial_id, backend = self.name(), "signalling cancellation");
        token.cancel();
    }

    fn name(&self) -> &str;
}

/// Runs the routine on tokio's blocking thread pool in this process.
pub struct LocalBackend {
    routine: Arc<dyn TrainingRoutine>,
}

impl LocalBackend {
    pub fn new(routine: impl TrainingRoutine) -> Self {
        Self {
            routine: Arc::new(routine),
        }
    }

    pub fn from_arc(routine: Arc<dyn TrainingRoutine>) -> Self {
        Self { routine }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn submit(&self, job: TrialJob) -> HsResult<TrialHandle> {
        let (tx, rx) = oneshot::channel();
        let routine = Arc::clone(&self.routine);
        let trial_id = job.trial_id;

        tokio::spawn(async move {
            let joined =
                tokio::task::spawn_blocking(move || routine.run(&job.parameters, &job.sink)).await;
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(TrialExecutionError::Panicked {
                    message: panic_message(e.into_panic()),
                }),
                Err(e) => Err(TrialExecutionError::EnvironmentLost {
                    message: e.to_string(),
                }),
            };
            // The runner may have stopped listening; nothing left to do then.
            let _ = tx.send(result);
        });

        Ok(TrialHandle::new(trial_id, rx))
    }

    fn name(&self) -> &str {
        "local"
    }
}
