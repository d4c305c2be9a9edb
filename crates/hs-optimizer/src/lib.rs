//! # hs-optimizer
//!
//! Hyperparameter search orchestration for Hypersweep.
//!
//! Provides parameter space sampling (grid, random), an append-only result
//! store, early termination policies, pluggable execution backends and the
//! scheduler that drives a search under concurrency, trial and time budgets.

mod backend;
mod events;
mod policy;
mod runner;
mod scheduler;
mod sink;
mod space;
mod store;

pub use backend::{
    CancelToken, ExecutionBackend, ExecutionResult, LocalBackend, TrainingRoutine, TrialHandle,
    TrialJob, TrialOutput,
};
pub use events::{CancelReason, SearchEvent};
pub use policy::{
    build_policy, BanditPolicy, EarlyTerminationPolicy, MedianStoppingPolicy, NeverCancel, Slack,
    TruncationSelectionPolicy,
};
pub use runner::{TrialOutcome, TrialRunner};
pub use scheduler::{SearchOutcome, SearchScheduler, SearchSummary, StopHandle};
pub use sink::MetricSink;
pub use space::{
    GridSearch, ParameterSpace, RandomSearch, Sampling, SamplingMode, SearchStrategy, SpaceConfig,
    Truncation, DEFAULT_GRID_STEPS,
};
pub use store::{BestResult, ResultStore, StatusCounts};
