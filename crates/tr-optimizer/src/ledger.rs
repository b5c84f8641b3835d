//! The trial ledger: the authoritative record of every trial in an
//! experiment.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tr_types::{Observation, Parameterization, SearchSpace, TrellisError, TrellisResult};

use crate::trial::{Trial, TrialStatus};

/// What a ledger operation did to a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The trial moved out of `from`.
    Applied { from: TrialStatus },
    /// The trial was already terminal; nothing changed.
    NoOp { status: TrialStatus },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Whether this transition freed a RUNNING slot.
    pub fn released_running(self) -> bool {
        matches!(
            self,
            Self::Applied {
                from: TrialStatus::Running
            }
        )
    }
}

/// Per-status trial counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub candidate: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.candidate + self.running + self.completed + self.failed + self.abandoned
    }
}

/// Index-ordered trial storage. A trial's index is its position, so indices
/// start at 0 and are never reused or skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialLedger {
    trials: Vec<Trial>,
}

impl TrialLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted trials, checking that indices are
    /// contiguous from 0 and parameterizations still validate.
    pub(crate) fn from_trials(trials: Vec<Trial>, space: &SearchSpace) -> TrellisResult<Self> {
        for (position, trial) in trials.iter().enumerate() {
            if trial.index() != position {
                return Err(TrellisError::Internal(format!(
                    "trial record {} found at position {position}; indices must be contiguous",
                    trial.index()
                )));
            }
            space.validate(trial.parameterization())?;
        }
        Ok(Self { trials })
    }

    pub(crate) fn create_trial(
        &mut self,
        space: &SearchSpace,
        parameterization: Parameterization,
        generation_method: &str,
    ) -> TrellisResult<usize> {
        space.validate(&parameterization)?;
        let index = self.trials.len();
        self.trials
            .push(Trial::new(index, parameterization, generation_method));
        debug!(trial_index = index, method = generation_method, "trial created");
        Ok(index)
    }

    pub(crate) fn mark_running(&mut self, index: usize) -> TrellisResult<Transition> {
        let trial = self.get_mut(index)?;
        match trial.status() {
            TrialStatus::Candidate => {
                trial.mark_running();
                debug!(trial_index = index, "trial running");
                Ok(Transition::Applied {
                    from: TrialStatus::Candidate,
                })
            }
            other => Err(invalid_transition(index, other, "mark running")),
        }
    }

    pub(crate) fn complete_trial(
        &mut self,
        index: usize,
        result: Observation,
    ) -> TrellisResult<Transition> {
        let trial = self.get_mut(index)?;
        match trial.status() {
            TrialStatus::Running => {
                trial.mark_completed(result);
                debug!(trial_index = index, mean = result.mean, "trial completed");
                Ok(Transition::Applied {
                    from: TrialStatus::Running,
                })
            }
            status if status.is_terminal() => {
                warn!(trial_index = index, %status, "ignoring completion of terminal trial");
                Ok(Transition::NoOp { status })
            }
            other => Err(invalid_transition(index, other, "complete")),
        }
    }

    pub(crate) fn fail_trial(&mut self, index: usize, reason: &str) -> TrellisResult<Transition> {
        let trial = self.get_mut(index)?;
        match trial.status() {
            TrialStatus::Running => {
                trial.mark_failed(reason.to_string());
                debug!(trial_index = index, reason, "trial failed");
                Ok(Transition::Applied {
                    from: TrialStatus::Running,
                })
            }
            status if status.is_terminal() => {
                debug!(trial_index = index, %status, "ignoring failure of terminal trial");
                Ok(Transition::NoOp { status })
            }
            other => Err(invalid_transition(index, other, "fail")),
        }
    }

    pub(crate) fn abandon_trial(&mut self, index: usize, reason: &str) -> TrellisResult<Transition> {
        let trial = self.get_mut(index)?;
        let status = trial.status();
        if status.is_terminal() {
            debug!(trial_index = index, %status, "ignoring abandonment of terminal trial");
            return Ok(Transition::NoOp { status });
        }
        trial.mark_abandoned(reason.to_string());
        debug!(trial_index = index, from = %status, reason, "trial abandoned");
        Ok(Transition::Applied { from: status })
    }

    pub fn get(&self, index: usize) -> TrellisResult<&Trial> {
        self.trials
            .get(index)
            .ok_or(TrellisError::TrialNotFound { trial_index: index })
    }

    fn get_mut(&mut self, index: usize) -> TrellisResult<&mut Trial> {
        self.trials
            .get_mut(index)
            .ok_or(TrellisError::TrialNotFound { trial_index: index })
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// All trials in creation order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn running_count(&self) -> usize {
        self.count(TrialStatus::Running)
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status() == status).count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for trial in &self.trials {
            match trial.status() {
                TrialStatus::Candidate => counts.candidate += 1,
                TrialStatus::Running => counts.running += 1,
                TrialStatus::Completed => counts.completed += 1,
                TrialStatus::Failed => counts.failed += 1,
                TrialStatus::Abandoned => counts.abandoned += 1,
            }
        }
        counts
    }

    /// COMPLETED trials in creation order. The iterator is lazy and can be
    /// cloned to restart it.
    pub fn completed_trials(&self) -> impl Iterator<Item = &Trial> + Clone + '_ {
        self.trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Completed)
    }

    /// Trials that are CANDIDATE or RUNNING.
    pub fn pending_trials(&self) -> impl Iterator<Item = &Trial> + Clone + '_ {
        self.trials.iter().filter(|t| !t.status().is_terminal())
    }
}

fn invalid_transition(index: usize, from: TrialStatus, action: &'static str) -> TrellisError {
    TrellisError::InvalidStateTransition {
        trial_index: index,
        from: from.to_string(),
        action,
    }
}
