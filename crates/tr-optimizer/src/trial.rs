//! Trial records and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tr_types::{Observation, Parameterization};

/// Lifecycle state of a trial.
///
/// `Candidate → Running → {Completed, Failed}`, and any non-terminal state
/// may move to `Abandoned`. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Candidate,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "CANDIDATE",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Abandoned => "ABANDONED",
        }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single trial: one parameterization and what became of it.
///
/// Only the owning ledger mutates a trial; the parameterization never changes
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    index: usize,
    parameterization: Parameterization,
    status: TrialStatus,
    result: Option<Observation>,
    /// Name of the strategy step that proposed this trial.
    generation_method: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

impl Trial {
    pub(crate) fn new(
        index: usize,
        parameterization: Parameterization,
        generation_method: impl Into<String>,
    ) -> Self {
        Self {
            index,
            parameterization,
            status: TrialStatus::Candidate,
            result: None,
            generation_method: generation_method.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameterization(&self) -> &Parameterization {
        &self.parameterization
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Observation> {
        self.result.as_ref()
    }

    pub fn generation_method(&self) -> &str {
        &self.generation_method
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Wall-clock run time, once the trial has started and finished.
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, result: Observation) {
        self.status = TrialStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub(crate) fn mark_failed(&mut self, reason: String) {
        self.status = TrialStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.failure_reason = Some(reason);
    }

    pub(crate) fn mark_abandoned(&mut self, reason: String) {
        self.status = TrialStatus::Abandoned;
        self.completed_at = Some(Utc::now());
        self.failure_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tr_types::{parameterization, ParameterValue};

    #[test]
    fn trial_lifecycle() {
        let params = parameterization([("lr", ParameterValue::Float(0.01))]);
        let mut trial = Trial::new(0, params.clone(), "sobol");
        assert_eq!(trial.status(), TrialStatus::Candidate);
        assert!(trial.started_at().is_none());

        trial.mark_running();
        assert_eq!(trial.status(), TrialStatus::Running);
        assert!(trial.started_at().is_some());

        trial.mark_completed(Observation::new(0.92));
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(trial.completed_at().is_some());
        assert!(trial.duration_seconds().is_some());
        assert_eq!(trial.result().unwrap().mean, 0.92);
        assert_eq!(trial.parameterization(), &params);
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(4, Parameterization::new(), "random");
        trial.mark_running();
        trial.mark_failed("training diverged".into());
        assert_eq!(trial.status(), TrialStatus::Failed);
        assert_eq!(trial.failure_reason(), Some("training diverged"));
        assert!(trial.result().is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(!TrialStatus::Candidate.is_terminal());
        assert!(!TrialStatus::Running.is_terminal());
        assert!(TrialStatus::Completed.is_terminal());
        assert!(TrialStatus::Failed.is_terminal());
        assert!(TrialStatus::Abandoned.is_terminal());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&TrialStatus::Abandoned).unwrap();
        assert_eq!(json, "\"ABANDONED\"");
        assert_eq!(TrialStatus::Running.to_string(), "RUNNING");
    }
}
