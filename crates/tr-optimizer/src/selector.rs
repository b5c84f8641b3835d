//! Best-point selection and result summaries.

use serde::{Deserialize, Serialize};
use tr_types::{BestPoint, Parameterization, TrellisError, TrellisResult};

use crate::experiment::Experiment;
use crate::ledger::StatusCounts;
use crate::strategy::GenerationStrategy;

/// Aggregate statistics over the COMPLETED trials of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub counts: StatusCounts,
    pub objective_mean: Option<f64>,
    pub objective_std: Option<f64>,
    pub best_observed: Option<f64>,
    pub worst_observed: Option<f64>,
    pub best_trial_index: Option<usize>,
}

/// Answers best-point queries over an experiment, optionally consulting the
/// strategy's model.
pub struct ResultSelector<'a> {
    experiment: &'a Experiment,
    model: Option<&'a dyn GenerationStrategy>,
}

impl<'a> ResultSelector<'a> {
    pub fn new(experiment: &'a Experiment) -> Self {
        Self {
            experiment,
            model: None,
        }
    }

    /// Prefer the strategy's posterior means over raw observations when it
    /// has a fitted model.
    pub fn with_model(mut self, strategy: &'a dyn GenerationStrategy) -> Self {
        self.model = Some(strategy);
        self
    }

    /// Best COMPLETED trial under the objective's direction. Ties go to the
    /// lowest trial index. Trials with a non-finite mean never win.
    pub fn best_parameters(&self) -> TrellisResult<BestPoint> {
        let completed: Vec<_> = self
            .experiment
            .completed_trials()
            .filter_map(|t| t.result().map(|obs| (t, *obs)))
            .collect();
        if completed.is_empty() {
            return Err(TrellisError::NoCompletedTrials);
        }

        let points: Vec<Parameterization> = completed
            .iter()
            .map(|(t, _)| t.parameterization().clone())
            .collect();
        let predictions = self
            .model
            .and_then(|m| m.predict(&points))
            .filter(|p| p.len() == points.len());

        let objective = self.experiment.objective();
        let mut best: Option<BestPoint> = None;
        for (i, (trial, obs)) in completed.iter().enumerate() {
            let (mean, variance, model_predicted) = match &predictions {
                Some(preds) if preds[i].mean.is_finite() => {
                    (preds[i].mean, Some(preds[i].variance), true)
                }
                _ => (obs.mean, obs.variance(), false),
            };
            if !mean.is_finite() {
                continue;
            }
            let better = best
                .as_ref()
                .map_or(true, |b| objective.improves(mean, b.mean));
            if better {
                best = Some(BestPoint {
                    trial_index: trial.index(),
                    parameterization: trial.parameterization().clone(),
                    mean,
                    variance,
                    model_predicted,
                });
            }
        }
        best.ok_or(TrellisError::NoCompletedTrials)
    }

    pub fn summary(&self) -> ResultSummary {
        let objective = self.experiment.objective();
        let observed: Vec<(usize, f64)> = self
            .experiment
            .completed_trials()
            .filter_map(|t| t.result().map(|obs| (t.index(), obs.mean)))
            .filter(|(_, v)| v.is_finite())
            .collect();

        let mut summary = ResultSummary {
            counts: self.experiment.status_counts(),
            ..Default::default()
        };
        if observed.is_empty() {
            return summary;
        }

        let n = observed.len() as f64;
        let mean = observed.iter().map(|(_, v)| v).sum::<f64>() / n;
        let var = observed.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
        summary.objective_mean = Some(mean);
        summary.objective_std = Some(var.sqrt());

        let mut best = observed[0];
        let mut worst = observed[0];
        for &(index, value) in &observed[1..] {
            if objective.improves(value, best.1) {
                best = (index, value);
            }
            if objective.improves(worst.1, value) {
                worst = (index, value);
            }
        }
        summary.best_observed = Some(best.1);
        summary.worst_observed = Some(worst.1);
        summary.best_trial_index = Some(best.0);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::create_experiment;
    use crate::strategy::{GenerationOutcome, LedgerSnapshot, Prediction};
    use tr_types::{parameterization, Observation, ParameterSpec, ParameterValue};

    fn experiment_with(values: &[f64], minimize: bool) -> Experiment {
        let mut exp = create_experiment(
            "select",
            vec![ParameterSpec::float("x", 0.0, 1.0)],
            "score",
            minimize,
        )
        .unwrap();
        for (i, v) in values.iter().enumerate() {
            let p = parameterization([("x", ParameterValue::Float(i as f64 / 10.0))]);
            let index = exp.create_trial(p, "manual").unwrap();
            exp.mark_running(index).unwrap();
            exp.complete_trial(index, Observation::new(*v)).unwrap();
        }
        exp
    }

    struct ConstantModel(f64);

    impl GenerationStrategy for ConstantModel {
        fn ask(&mut self, _: &LedgerSnapshot, _: usize) -> TrellisResult<GenerationOutcome> {
            Ok(GenerationOutcome::NoProposalYet {
                reason: "test".into(),
            })
        }

        fn predict(&self, points: &[Parameterization]) -> Option<Vec<Prediction>> {
            Some(
                points
                    .iter()
                    .map(|p| Prediction {
                        mean: self.0 - p["x"].as_f64().unwrap_or(0.0),
                        variance: 0.01,
                    })
                    .collect(),
            )
        }

        fn name(&self) -> &str {
            "constant"
        }
    }

    #[test]
    fn empty_experiment_has_no_best() {
        let exp = experiment_with(&[], true);
        assert!(matches!(
            ResultSelector::new(&exp).best_parameters(),
            Err(TrellisError::NoCompletedTrials)
        ));
    }

    #[test]
    fn single_completed_trial_is_best() {
        let mut exp = experiment_with(&[0.4], false);
        let p = parameterization([("x", ParameterValue::Float(0.9))]);
        let failed = exp.create_trial(p, "manual").unwrap();
        exp.mark_running(failed).unwrap();
        exp.fail_trial(failed, "diverged").unwrap();

        let best = ResultSelector::new(&exp).best_parameters().unwrap();
        assert_eq!(best.trial_index, 0);
        assert_eq!(best.mean, 0.4);
        assert_eq!(best.parameterization["x"], ParameterValue::Float(0.0));
    }

    #[test]
    fn respects_direction() {
        let exp = experiment_with(&[3.0, 1.0, 2.0], true);
        assert_eq!(ResultSelector::new(&exp).best_parameters().unwrap().trial_index, 1);

        let exp = experiment_with(&[3.0, 1.0, 2.0], false);
        let best = ResultSelector::new(&exp).best_parameters().unwrap();
        assert_eq!(best.trial_index, 0);
        assert_eq!(best.mean, 3.0);
        assert!(!best.model_predicted);
    }

    #[test]
    fn ties_go_to_earliest_trial() {
        let exp = experiment_with(&[0.5, 0.9, 0.9], false);
        assert_eq!(ResultSelector::new(&exp).best_parameters().unwrap().trial_index, 1);
    }

    #[test]
    fn non_finite_results_never_win() {
        let exp = experiment_with(&[f64::NAN, 2.0], true);
        assert_eq!(ResultSelector::new(&exp).best_parameters().unwrap().trial_index, 1);
    }

    #[test]
    fn model_predictions_take_precedence() {
        // Observed best is trial 0; the model prefers the largest x.
        let exp = experiment_with(&[0.0, 5.0, 9.0], true);
        let model = ConstantModel(1.0);
        let best = ResultSelector::new(&exp).with_model(&model).best_parameters().unwrap();
        assert_eq!(best.trial_index, 2);
        assert!(best.model_predicted);
        assert_eq!(best.variance, Some(0.01));
    }

    #[test]
    fn summary_statistics() {
        let exp = experiment_with(&[1.0, 3.0, 2.0], false);
        let summary = ResultSelector::new(&exp).summary();
        assert_eq!(summary.counts.completed, 3);
        assert_eq!(summary.objective_mean, Some(2.0));
        assert_eq!(summary.best_observed, Some(3.0));
        assert_eq!(summary.worst_observed, Some(1.0));
        assert_eq!(summary.best_trial_index, Some(1));
        assert!((summary.objective_std.unwrap() - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }
}
