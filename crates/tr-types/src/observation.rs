//! Evaluation results and best-point answers.

use serde::{Deserialize, Serialize};

use crate::parameter::Parameterization;

/// Outcome of evaluating the objective at one parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observed objective value.
    pub mean: f64,
    /// Standard error of the observation, if the evaluator reports one.
    pub sem: Option<f64>,
}

impl Observation {
    pub fn new(mean: f64) -> Self {
        Self { mean, sem: None }
    }

    pub fn with_sem(mut self, sem: f64) -> Self {
        self.sem = Some(sem);
        self
    }

    /// Observation noise variance (`sem²`), when known.
    pub fn variance(&self) -> Option<f64> {
        self.sem.map(|s| s * s)
    }
}

/// The answer to a best-point query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPoint {
    pub trial_index: usize,
    pub parameterization: Parameterization,
    /// Observed or model-predicted objective mean.
    pub mean: f64,
    /// Variance of `mean`; the covariance of a single objective.
    pub variance: Option<f64>,
    /// Whether `mean` / `variance` come from the strategy's model rather
    /// than the raw observation.
    pub model_predicted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variance_from_sem() {
        let obs = Observation::new(0.8).with_sem(0.1);
        assert!((obs.variance().unwrap() - 0.01).abs() < 1e-12);
        assert_eq!(Observation::new(0.8).variance(), None);
    }
}
