//! Training routine that runs an external program per trial.
//!
//! Parameters are passed as `--name value` arguments. The program reports
//! metrics by printing lines of the form `##metric name=value` on stdout and
//! finds its trial id and output directory in `HYPERSWEEP_TRIAL_ID` and
//! `HYPERSWEEP_OUTPUT_DIR`.

use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use hs_optimizer::{CancelToken, ExecutionResult, MetricSink, TrainingRoutine, TrialOutput};
use hs_types::{ParameterSet, TrialExecutionError};

use crate::settings::OUTPUT_DIR_ENV;

pub const TRIAL_ID_ENV: &str = "HYPERSWEEP_TRIAL_ID";
const METRIC_PREFIX: &str = "##metric ";

pub struct CommandRoutine {
    program: String,
    args: Vec<String>,
    output_root: PathBuf,
    poll_interval: Duration,
}

impl CommandRoutine {
    pub fn new(program: impl Into<String>, args: Vec<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            output_root: output_root.into(),
            poll_interval: Duration::from_millis(50),
        }
    }

    fn spawn(&self, parameters: &ParameterSet, trial_id: u64, output_dir: &Path) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(parameter_args(parameters))
            .env(TRIAL_ID_ENV, trial_id.to_string())
            .env(OUTPUT_DIR_ENV, output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Own process group, so cancellation also reaches whatever the
        // program starts.
        #[cfg(unix)]
        command.process_group(0);
        debug!(trial_id, program = %self.program, parameters = %parameters, "spawning trial process");
        command.spawn()
    }

    /// Poll the child until it exits; the watcher may kill it meanwhile.
    /// `finished` is set under the lock so the watcher never signals a
    /// reaped pid.
    fn reap(&self, child: &Mutex<Child>, finished: &AtomicBool) -> Result<ExitStatus, TrialExecutionError> {
        loop {
            {
                let mut child = child.lock();
                if let Some(status) = child.try_wait().map_err(lost)? {
                    finished.store(true, Ordering::SeqCst);
                    return Ok(status);
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

fn lost(e: std::io::Error) -> TrialExecutionError {
    TrialExecutionError::EnvironmentLost {
        message: e.to_string(),
    }
}

/// `--name value` pairs in declaration order.
pub fn parameter_args(parameters: &ParameterSet) -> Vec<String> {
    parameters
        .iter()
        .flat_map(|(name, value)| [format!("--{name}"), value.to_string()])
        .collect()
}

/// Parse a `##metric name=value` line.
pub fn parse_metric_line(line: &str) -> Option<(&str, f64)> {
    let (name, value) = line.trim().strip_prefix(METRIC_PREFIX)?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    value.trim().parse().ok().map(|value| (name, value))
}

/// Kill the child and, on Unix, every process left in its group.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        if killed {
            return;
        }
        debug!(pid = child.id(), "process group kill failed, killing the child only");
    }
    let _ = child.kill();
}

/// Kill the child once the trial is cancelled.
fn watch_cancellation(
    child: Arc<Mutex<Child>>,
    token: CancelToken,
    finished: Arc<AtomicBool>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !finished.load(Ordering::SeqCst) {
            if token.is_cancelled() {
                let mut child = child.lock();
                if !finished.load(Ordering::SeqCst) {
                    terminate(&mut child);
                }
                return;
            }
            std::thread::sleep(poll_interval);
        }
    })
}

impl TrainingRoutine for CommandRoutine {
    fn run(&self, parameters: &ParameterSet, sink: &MetricSink) -> ExecutionResult {
        let trial_id = sink.trial_id();
        let output_dir = self.output_root.join(format!("trial-{trial_id}"));
        std::fs::create_dir_all(&output_dir).map_err(lost)?;

        let mut child = self.spawn(parameters, trial_id, &output_dir).map_err(lost)?;
        let stdout = child.stdout.take().ok_or_else(|| TrialExecutionError::EnvironmentLost {
            message: "child stdout was not captured".to_string(),
        })?;

        let child = Arc::new(Mutex::new(child));
        let finished = Arc::new(AtomicBool::new(false));
        let watcher = watch_cancellation(
            Arc::clone(&child),
            sink.token().clone(),
            Arc::clone(&finished),
            self.poll_interval,
        );

        let mut reported = Ok(());
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(trial_id, error = %e, "stopped reading trial output");
                    break;
                }
            };
            if let Some((name, value)) = parse_metric_line(&line) {
                if let Err(cancelled) = sink.log(name, value) {
                    terminate(&mut child.lock());
                    reported = Err(cancelled);
                    break;
                }
            }
        }

        let status = self.reap(&child, &finished);
        finished.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        reported?;
        if sink.is_cancelled() {
            return Err(TrialExecutionError::Cancelled);
        }
        let status = status?;
        if !status.success() {
            return Err(TrialExecutionError::routine(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(TrialOutput::with_artifact(output_dir.display().to_string()))
    }
}
