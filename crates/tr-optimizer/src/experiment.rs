//! Experiments: a search space plus the ledger of trials run against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};
use tr_types::{
    Objective, Observation, ParameterSpec, Parameterization, SearchSpace, TrellisError,
    TrellisResult,
};
use uuid::Uuid;

use crate::ledger::{StatusCounts, TrialLedger, Transition};
use crate::trial::Trial;

/// Unique experiment identifier.
pub type ExperimentId = Uuid;

/// Version of the persisted [`ExperimentRecord`] layout.
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Create an experiment from raw parameter specs.
///
/// Fails with `DuplicateParameterName` or `InvalidBounds` on malformed specs.
pub fn create_experiment(
    name: impl Into<String>,
    parameters: Vec<ParameterSpec>,
    objective_name: impl Into<String>,
    minimize: bool,
) -> TrellisResult<Experiment> {
    let objective = Objective {
        name: objective_name.into(),
        minimize,
    };
    let space = SearchSpace::new(parameters, objective)?;
    Ok(Experiment::new(name, space))
}

/// Owns the search space and every trial. Performs no optimization logic;
/// all mutation goes through the ledger operations below.
#[derive(Debug, Clone)]
pub struct Experiment {
    id: ExperimentId,
    name: String,
    search_space: SearchSpace,
    ledger: TrialLedger,
    created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, search_space: SearchSpace) -> Self {
        let experiment = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            search_space,
            ledger: TrialLedger::new(),
            created_at: Utc::now(),
        };
        info!(
            experiment = %experiment.name,
            id = %experiment.id,
            parameters = experiment.search_space.len(),
            objective = %experiment.search_space.objective().name,
            minimize = experiment.search_space.objective().minimize,
            "experiment created"
        );
        experiment
    }

    pub fn id(&self) -> ExperimentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.search_space
    }

    pub fn objective(&self) -> &Objective {
        self.search_space.objective()
    }

    pub fn ledger(&self) -> &TrialLedger {
        &self.ledger
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn trial(&self, index: usize) -> TrellisResult<&Trial> {
        self.ledger.get(index)
    }

    pub fn num_trials(&self) -> usize {
        self.ledger.len()
    }

    pub fn running_count(&self) -> usize {
        self.ledger.running_count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.ledger.status_counts()
    }

    pub fn completed_trials(&self) -> impl Iterator<Item = &Trial> + Clone + '_ {
        self.ledger.completed_trials()
    }

    // -- ledger operations ---------------------------------------------------

    pub fn create_trial(
        &mut self,
        parameterization: Parameterization,
        generation_method: &str,
    ) -> TrellisResult<usize> {
        self.ledger
            .create_trial(&self.search_space, parameterization, generation_method)
    }

    pub fn mark_running(&mut self, index: usize) -> TrellisResult<Transition> {
        self.ledger.mark_running(index)
    }

    pub fn complete_trial(&mut self, index: usize, result: Observation) -> TrellisResult<Transition> {
        self.ledger.complete_trial(index, result)
    }

    pub fn fail_trial(&mut self, index: usize, reason: &str) -> TrellisResult<Transition> {
        self.ledger.fail_trial(index, reason)
    }

    pub fn abandon_trial(&mut self, index: usize, reason: &str) -> TrellisResult<Transition> {
        self.ledger.abandon_trial(index, reason)
    }

    /// Abandon every CANDIDATE or RUNNING trial, e.g. after a resume when
    /// their workers are gone. Returns the abandoned indices.
    pub fn abandon_pending(&mut self, reason: &str) -> TrellisResult<Vec<usize>> {
        let pending: Vec<usize> = self.ledger.pending_trials().map(|t| t.index()).collect();
        for &index in &pending {
            self.ledger.abandon_trial(index, reason)?;
        }
        Ok(pending)
    }

    // -- persistence ---------------------------------------------------------

    pub fn to_record(&self) -> ExperimentRecord {
        ExperimentRecord {
            format_version: RECORD_FORMAT_VERSION,
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            search_space: self.search_space.clone(),
            trials: self.ledger.trials().to_vec(),
        }
    }

    /// Rebuild an experiment from a record, replaying trials in index order.
    pub fn from_record(record: ExperimentRecord) -> TrellisResult<Self> {
        if record.format_version != RECORD_FORMAT_VERSION {
            return Err(TrellisError::Config(format!(
                "unsupported experiment record version {}",
                record.format_version
            )));
        }
        // Records are untrusted input; re-run search space validation.
        let search_space = SearchSpace::new(
            record.search_space.parameters().to_vec(),
            record.search_space.objective().clone(),
        )?;
        let ledger = TrialLedger::from_trials(record.trials, &search_space)?;
        Ok(Self {
            id: record.id,
            name: record.name,
            search_space,
            ledger,
            created_at: record.created_at,
        })
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> TrellisResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_record())?;
        std::fs::write(path, json)?;
        info!(experiment = %self.name, path = %path.display(), trials = self.ledger.len(), "experiment saved");
        Ok(())
    }

    /// Load a saved experiment. Trials that were still pending when it was
    /// saved are abandoned, since no worker will report for them.
    pub fn load_json(path: impl AsRef<Path>) -> TrellisResult<Self> {
        let path = path.as_ref();
        let record: ExperimentRecord = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let mut experiment = Self::from_record(record)?;
        let abandoned = experiment.abandon_pending("abandoned on resume")?;
        if !abandoned.is_empty() {
            warn!(
                experiment = %experiment.name,
                trials = ?abandoned,
                "abandoned trials left pending by a previous run"
            );
        }
        Ok(experiment)
    }
}

/// Self-describing persisted form of an experiment: an ordered list of
/// trial records plus the space they were drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub format_version: u32,
    pub id: ExperimentId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub search_space: SearchSpace,
    pub trials: Vec<Trial>,
}
