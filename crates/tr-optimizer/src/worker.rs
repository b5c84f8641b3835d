//! Trial task descriptors, progress reporting and the evaluator seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinError;
use tr_types::{Observation, Parameterization, WorkerFailure};
use uuid::Uuid;

/// Per-trial resource hints forwarded with every [`TrialTask`]. The
/// dispatcher does not enforce them; evaluators that launch external jobs
/// size those jobs from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerResources {
    /// Threads the objective may use.
    pub threads: usize,
    /// Accelerators reserved for one trial.
    pub accelerators: u32,
    pub memory_limit_mb: Option<u64>,
    /// Scheduler labels such as a node pool.
    pub labels: BTreeMap<String, String>,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            threads: 1,
            accelerators: 0,
            memory_limit_mb: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Everything a worker needs to evaluate one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialTask {
    pub experiment_id: Uuid,
    pub experiment_name: String,
    pub trial_index: usize,
    pub parameterization: Parameterization,
    /// The metric the evaluator must report.
    pub objective_name: String,
    pub resources: WorkerResources,
    pub dispatched_at: DateTime<Utc>,
}

/// Intermediate progress from a running evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub trial_index: usize,
    pub step: u64,
    pub value: Option<f64>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Handle given to an evaluator for streaming progress back to the
/// dispatcher. Reporting never blocks and never fails the trial.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    trial_index: usize,
    sender: Option<Sender<ProgressUpdate>>,
}

impl ProgressReporter {
    pub fn new(trial_index: usize, sender: Sender<ProgressUpdate>) -> Self {
        Self {
            trial_index,
            sender: Some(sender),
        }
    }

    /// A reporter that drops everything, for evaluating outside a dispatcher.
    pub fn detached(trial_index: usize) -> Self {
        Self {
            trial_index,
            sender: None,
        }
    }

    pub fn trial_index(&self) -> usize {
        self.trial_index
    }

    pub fn report(&self, step: u64, value: f64) {
        self.send(step, Some(value), None);
    }

    pub fn note(&self, step: u64, message: impl Into<String>) {
        self.send(step, None, Some(message.into()));
    }

    fn send(&self, step: u64, value: Option<f64>, message: Option<String>) {
        if let Some(sender) = &self.sender {
            // The dispatcher may already be gone; progress is best-effort.
            let _ = sender.try_send(ProgressUpdate {
                trial_index: self.trial_index,
                step,
                value,
                message,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Evaluates the objective for one trial.
///
/// Implementations report failure through [`WorkerFailure`]; the dispatcher
/// records it against the trial and keeps going.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    async fn evaluate(
        &self,
        task: TrialTask,
        progress: ProgressReporter,
    ) -> Result<Observation, WorkerFailure>;
}

#[async_trait]
impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    async fn evaluate(
        &self,
        task: TrialTask,
        progress: ProgressReporter,
    ) -> Result<Observation, WorkerFailure> {
        (**self).evaluate(task, progress).await
    }
}

/// Adapts a synchronous closure into an [`Evaluator`]. Each call runs on
/// tokio's blocking pool so CPU-bound objectives do not stall the runtime.
pub struct FnEvaluator<F> {
    func: Arc<F>,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&Parameterization, &ProgressReporter) -> Result<Observation, WorkerFailure>
        + Send
        + Sync
        + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&Parameterization, &ProgressReporter) -> Result<Observation, WorkerFailure>
        + Send
        + Sync
        + 'static,
{
    async fn evaluate(
        &self,
        task: TrialTask,
        progress: ProgressReporter,
    ) -> Result<Observation, WorkerFailure> {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(&task.parameterization, &progress))
            .await
            .map_err(join_failure)?
    }
}

/// The failure behind an evaluation task that did not return normally.
/// Panic payloads keep their message.
pub(crate) fn join_failure(error: JoinError) -> WorkerFailure {
    if error.is_cancelled() {
        return WorkerFailure::Cancelled;
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    WorkerFailure::Panicked { message }
}
