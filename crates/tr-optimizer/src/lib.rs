//! # tr-optimizer
//!
//! Ask-tell orchestration for black-box optimization.
//!
//! Holds the experiment and its trial ledger, the pluggable generation
//! strategies (random, quasi-random, Sobol followed by GP/EI), the
//! concurrency limiter, the thread-safe [`AskTellService`], and the
//! [`Dispatcher`] that runs trials on tokio workers until the budget is spent.

mod config;
mod dispatcher;
mod experiment;
mod ledger;
mod limiter;
mod selector;
mod service;
pub mod strategy;
mod telemetry;
mod trial;
mod worker;

pub use config::RunConfig;
pub use dispatcher::{CancelHandle, Dispatcher, RunReport, RunState};
pub use experiment::{
    create_experiment, Experiment, ExperimentId, ExperimentRecord, RECORD_FORMAT_VERSION,
};
pub use ledger::{StatusCounts, Transition, TrialLedger};
pub use limiter::ConcurrencyLimiter;
pub use selector::{ResultSelector, ResultSummary};
pub use service::{AskResponse, AskTellService, TrialOutcome};
pub use strategy::{
    GenerationOutcome, GenerationStrategy, LedgerSnapshot, ModelBasedConfig, ModelBasedStrategy,
    Prediction, Proposal, QuasiRandomStrategy, RandomSearch,
};
pub use telemetry::{ExperimentCreatedRecord, RunCompletedRecord, RunCreatedRecord};
pub use trial::{Trial, TrialStatus};
pub use worker::{
    Evaluator, FnEvaluator, ProgressReporter, ProgressUpdate, TrialTask, WorkerResources,
};
