//! Run telemetry records.
//!
//! Records hold only simple values so they can be flattened into a single
//! JSON object and logged to a tabular store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tr_types::BestPoint;

use crate::config::RunConfig;
use crate::dispatcher::RunState;
use crate::experiment::Experiment;

/// Description of an experiment at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCreatedRecord {
    pub experiment_name: String,
    pub num_parameters: usize,
    pub num_continuous_parameters: usize,
    pub num_discrete_parameters: usize,
    pub num_choice_parameters: usize,
    pub objective_name: String,
    pub minimize: bool,
}

impl ExperimentCreatedRecord {
    pub fn from_experiment(experiment: &Experiment) -> Self {
        let space = experiment.search_space();
        let counts = space.dimension_counts();
        Self {
            experiment_name: experiment.name().to_string(),
            num_parameters: space.len(),
            num_continuous_parameters: counts.continuous,
            num_discrete_parameters: counts.discrete,
            num_choice_parameters: counts.choice,
            objective_name: space.objective().name.clone(),
            minimize: space.objective().minimize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreatedRecord {
    pub experiment_created_record: ExperimentCreatedRecord,
    pub strategy_name: String,
    pub total_trials: usize,
    pub max_pending_trials: Option<usize>,
    pub trials_per_ask: usize,
    pub enforce_sequential_optimization: bool,
    pub max_failure_rate: f64,
    pub trial_timeout_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl RunCreatedRecord {
    pub fn new(experiment: &Experiment, strategy_name: &str, config: &RunConfig) -> Self {
        Self {
            experiment_created_record: ExperimentCreatedRecord::from_experiment(experiment),
            strategy_name: strategy_name.to_string(),
            total_trials: config.num_trials,
            max_pending_trials: config.effective_max_concurrent(),
            trials_per_ask: 1,
            enforce_sequential_optimization: config.enforce_sequential_optimization,
            max_failure_rate: config.max_failure_rate,
            trial_timeout_seconds: config.trial_timeout_seconds,
            created_at: Utc::now(),
        }
    }

    /// Flatten into one level, merging the nested experiment record.
    pub fn flatten(&self) -> Map<String, Value> {
        flatten_record(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompletedRecord {
    pub experiment_name: String,
    pub state: RunState,
    pub num_trials: usize,
    pub num_completed: usize,
    pub num_failed: usize,
    pub num_abandoned: usize,
    /// Trials that failed because the evaluator errored, panicked or timed
    /// out, as counted by the dispatcher.
    pub num_trials_bad_due_to_err: usize,
    /// Objective mean of the best point, if any trial completed.
    pub best_point_quality: Option<f64>,
    pub best_trial_index: Option<usize>,
    pub duration_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

impl RunCompletedRecord {
    pub fn new(
        experiment: &Experiment,
        state: RunState,
        num_trials_bad_due_to_err: usize,
        best: Option<&BestPoint>,
        duration_seconds: f64,
    ) -> Self {
        let counts = experiment.status_counts();
        Self {
            experiment_name: experiment.name().to_string(),
            state,
            num_trials: counts.total(),
            num_completed: counts.completed,
            num_failed: counts.failed,
            num_abandoned: counts.abandoned,
            num_trials_bad_due_to_err,
            best_point_quality: best.map(|b| b.mean),
            best_trial_index: best.map(|b| b.trial_index),
            duration_seconds,
            completed_at: Utc::now(),
        }
    }

    pub fn flatten(&self) -> Map<String, Value> {
        flatten_record(self)
    }
}

/// Serialize `record` and hoist the fields of any nested object to the top
/// level. Top-level scalars win over hoisted fields of the same name.
fn flatten_record<T: Serialize>(record: &T) -> Map<String, Value> {
    let fields = match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => fields,
        _ => return Map::new(),
    };
    let mut flat = Map::new();
    let mut nested = Vec::new();
    for (key, value) in fields {
        match value {
            Value::Object(inner) => nested.push(inner),
            other => {
                flat.insert(key, other);
            }
        }
    }
    for inner in nested {
        for (key, value) in inner {
            flat.entry(key).or_insert(value);
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::create_experiment;
    use serde_json::json;
    use tr_types::{parameterization, Observation, ParameterSpec, ParameterValue};

    fn experiment() -> Experiment {
        create_experiment(
            "telemetry",
            vec![
                ParameterSpec::log_float("lr", 1e-6, 0.4),
                ParameterSpec::int("layers", 1, 4),
                ParameterSpec::choice("optimizer", vec![json!("sgd"), json!("adam")]),
            ],
            "accuracy",
            false,
        )
        .unwrap()
    }

    #[test]
    fn created_record_flattens_experiment_fields() {
        let exp = experiment();
        let config = RunConfig::default().with_num_trials(12).with_max_concurrent(Some(2));
        let record = RunCreatedRecord::new(&exp, "sobol+gpei", &config);
        let flat = record.flatten();

        assert!(!flat.contains_key("experiment_created_record"));
        assert_eq!(flat["experiment_name"], json!("telemetry"));
        assert_eq!(flat["num_parameters"], json!(3));
        assert_eq!(flat["num_continuous_parameters"], json!(1));
        assert_eq!(flat["num_discrete_parameters"], json!(1));
        assert_eq!(flat["num_choice_parameters"], json!(1));
        assert_eq!(flat["strategy_name"], json!("sobol+gpei"));
        assert_eq!(flat["total_trials"], json!(12));
        assert_eq!(flat["max_pending_trials"], json!(2));
        assert_eq!(flat["trials_per_ask"], json!(1));
        assert!(flat.values().all(|v| !v.is_object()));
    }

    #[test]
    fn completed_record_counts_trials() {
        let mut exp = experiment();
        let p = parameterization([
            ("lr", ParameterValue::Float(0.01)),
            ("layers", ParameterValue::Int(2)),
            ("optimizer", ParameterValue::from("adam")),
        ]);
        for i in 0..3 {
            let index = exp.create_trial(p.clone(), "manual").unwrap();
            exp.mark_running(index).unwrap();
            if i == 2 {
                exp.fail_trial(index, "boom").unwrap();
            } else {
                exp.complete_trial(index, Observation::new(0.9)).unwrap();
            }
        }
        let best = BestPoint {
            trial_index: 0,
            parameterization: p,
            mean: 0.9,
            variance: None,
            model_predicted: false,
        };
        let record = RunCompletedRecord::new(&exp, RunState::Completed, 1, Some(&best), 2.5);
        assert_eq!(record.num_trials, 3);
        assert_eq!(record.num_completed, 2);
        assert_eq!(record.num_failed, 1);
        assert_eq!(record.best_point_quality, Some(0.9));

        let flat = record.flatten();
        assert_eq!(flat["state"], json!("COMPLETED"));
        assert_eq!(flat["num_trials_bad_due_to_err"], json!(1));
    }
}
