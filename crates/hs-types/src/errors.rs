use thiserror::Error;

use crate::trial::{TrialId, TrialStatus};

/// Main error type for the Hypersweep system
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trial execution error: {0}")]
    TrialExecution(#[from] TrialExecutionError),

    #[error("Invalid transition for trial {trial_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        trial_id: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("No successful trial reported primary metric '{metric}'")]
    NoSuccessfulTrial { metric: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: TrialId },

    #[error("Trial {trial_id} did not acknowledge cancellation within {grace_ms} ms")]
    CancellationTimeout { trial_id: TrialId, grace_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Invalid parameter space or search configuration. Always raised before any
/// trial is dispatched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid parameter space: {message}")]
    InvalidSpace { message: String },

    #[error("Empty domain for parameter '{parameter}'")]
    EmptyDomain { parameter: String },

    #[error("Duplicate parameter '{parameter}'")]
    DuplicateParameter { parameter: String },

    #[error("Invalid search configuration: {message}")]
    InvalidSearch { message: String },

    #[error("Invalid early termination policy: {message}")]
    InvalidPolicy { message: String },
}

/// Failure of a single trial. Recorded on the trial, never fatal to the search.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialExecutionError {
    #[error("training routine failed: {message}")]
    Routine { message: String },

    #[error("training routine panicked: {message}")]
    Panicked { message: String },

    #[error("execution environment lost: {message}")]
    EnvironmentLost { message: String },

    #[error("trial was cancelled")]
    Cancelled,
}

impl TrialExecutionError {
    pub fn routine(message: impl Into<String>) -> Self {
        Self::Routine {
            message: message.into(),
        }
    }
}

/// Returned by the metric sink once the trial has been cancelled, so a routine
/// can bail out with `?`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("trial {trial_id} was cancelled")]
pub struct TrialCancelled {
    pub trial_id: TrialId,
}

impl From<TrialCancelled> for TrialExecutionError {
    fn from(_: TrialCancelled) -> Self {
        Self::Cancelled
    }
}

/// Result type alias for Hypersweep operations
pub type HsResult<T> = Result<T, HsError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config($crate::ConfigError::InvalidSearch {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating parameter space errors
#[macro_export]
macro_rules! space_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config($crate::ConfigError::InvalidSpace {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}
