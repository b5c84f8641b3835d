//! Generation strategies: pluggable procedures that turn observed trials
//! into new proposals.
//!
//! A strategy only ever sees a [`LedgerSnapshot`], a read-only copy of the
//! ledger taken under the experiment lock, and learns about results through
//! [`GenerationStrategy::tell`]. It never holds a reference to the
//! experiment or the dispatcher.

mod gp;
mod model;
mod quasi_random;
mod random;

pub use model::{ModelBasedConfig, ModelBasedStrategy};
pub use quasi_random::QuasiRandomStrategy;
pub use random::RandomSearch;

use serde::{Deserialize, Serialize};
use tr_types::{Observation, Parameterization, TrellisResult};

use crate::experiment::Experiment;

/// One completed trial as seen by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedObservation {
    pub trial_index: usize,
    pub parameterization: Parameterization,
    pub observation: Observation,
}

/// Read-only view of the ledger handed to [`GenerationStrategy::ask`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    /// COMPLETED trials in creation order.
    pub completed: Vec<CompletedObservation>,
    /// Parameterizations of CANDIDATE and RUNNING trials.
    pub pending: Vec<Parameterization>,
    pub running_count: usize,
    /// Total trials ever created, in any state.
    pub num_trials: usize,
}

impl LedgerSnapshot {
    pub fn capture(experiment: &Experiment) -> Self {
        let ledger = experiment.ledger();
        let completed = ledger
            .completed_trials()
            .filter_map(|t| {
                t.result().map(|obs| CompletedObservation {
                    trial_index: t.index(),
                    parameterization: t.parameterization().clone(),
                    observation: *obs,
                })
            })
            .collect();
        let pending = ledger
            .pending_trials()
            .map(|t| t.parameterization().clone())
            .collect();
        Self {
            completed,
            pending,
            running_count: ledger.running_count(),
            num_trials: ledger.len(),
        }
    }
}

/// A parameterization proposed by a strategy, tagged with the step that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub parameterization: Parameterization,
    pub generation_method: String,
}

/// Result of [`GenerationStrategy::ask`].
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// One or more new proposals (never empty).
    Proposed(Vec<Proposal>),
    /// Nothing to propose until more results arrive. Callers wait and retry.
    NoProposalYet { reason: String },
}

/// Posterior prediction at a point, in objective units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub mean: f64,
    pub variance: f64,
}

/// Common trait for all generation strategies.
///
/// Given the same sequence of `tell` calls and the same seed, `ask` must
/// produce the same proposals.
pub trait GenerationStrategy: Send {
    /// Propose up to `count` new parameterizations.
    fn ask(&mut self, snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome>;

    /// Report the result of a completed trial. Called at most once per index.
    fn tell(&mut self, _trial_index: usize, _result: &Observation) {}

    /// Posterior predictions at `points`, if the strategy has a fitted model.
    fn predict(&self, _points: &[Parameterization]) -> Option<Vec<Prediction>> {
        None
    }

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

impl<S: GenerationStrategy + ?Sized> GenerationStrategy for Box<S> {
    fn ask(&mut self, snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome> {
        (**self).ask(snapshot, count)
    }

    fn tell(&mut self, trial_index: usize, result: &Observation) {
        (**self).tell(trial_index, result)
    }

    fn predict(&self, points: &[Parameterization]) -> Option<Vec<Prediction>> {
        (**self).predict(points)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
