//! Sequential model-based generation: Sobol initialization followed by a
//! GP surrogate with Expected Improvement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tr_types::{Observation, Parameterization, SearchSpace, TrellisResult};

use super::gp::{expected_improvement, GpModel};
use super::quasi_random::QuasiRandomStrategy;
use super::{
    CompletedObservation, GenerationOutcome, GenerationStrategy, LedgerSnapshot, Prediction,
    Proposal,
};

/// Tuning knobs for [`ModelBasedStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelBasedConfig {
    /// Quasi-random trials generated before any model is fit.
    pub num_initialization_trials: usize,
    /// Completed trials required before the model step may run. Defaults to
    /// half of `num_initialization_trials`, rounded up.
    pub min_trials_observed: Option<usize>,
    /// Wait (NoProposalYet) for `min_trials_observed` results instead of
    /// generating more quasi-random points.
    pub enforce_sequential_optimization: bool,
    /// Random candidates scored per acquisition step.
    pub num_candidates: usize,
    /// Fraction of candidates drawn around the incumbent instead of globally.
    pub local_fraction: f64,
    /// Noise variance added to the kernel diagonal (standardized units).
    pub noise_variance: f64,
    pub seed: Option<u64>,
}

impl Default for ModelBasedConfig {
    fn default() -> Self {
        Self {
            num_initialization_trials: 5,
            min_trials_observed: None,
            enforce_sequential_optimization: true,
            num_candidates: 1000,
            local_fraction: 0.25,
            noise_variance: 1e-6,
            seed: None,
        }
    }
}

impl ModelBasedConfig {
    pub fn with_initialization_trials(mut self, n: usize) -> Self {
        self.num_initialization_trials = n;
        self
    }

    pub fn with_sequential_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_sequential_optimization = enforce;
        self
    }

    pub fn with_candidates(mut self, n: usize) -> Self {
        self.num_candidates = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn min_observed(&self) -> usize {
        self.min_trials_observed
            .unwrap_or_else(|| self.num_initialization_trials.div_ceil(2))
    }
}

/// A fitted surrogate together with the data it was fit on.
struct FittedModel {
    gp: GpModel,
    num_observations: usize,
}

/// Sobol initialization, then GP + Expected Improvement.
///
/// The fitted model is cached between asks and dropped on every `tell`.
/// Pending trials and earlier members of the same batch are fantasized at
/// their predicted mean (kriging believer) so concurrent proposals spread
/// out.
pub struct ModelBasedStrategy {
    space: SearchSpace,
    config: ModelBasedConfig,
    init: QuasiRandomStrategy,
    rng: StdRng,
    model: Option<FittedModel>,
    told: usize,
}

impl ModelBasedStrategy {
    pub fn new(space: SearchSpace, config: ModelBasedConfig) -> Self {
        let (init, rng) = match config.seed {
            Some(seed) => (
                QuasiRandomStrategy::with_seed(space.clone(), seed),
                StdRng::seed_from_u64(seed),
            ),
            None => {
                let mut rng = StdRng::from_os_rng();
                let init_seed = rng.random::<u64>();
                (QuasiRandomStrategy::with_seed(space.clone(), init_seed), rng)
            }
        };
        Self {
            space,
            config,
            init,
            rng,
            model: None,
            told: 0,
        }
    }

    pub fn config(&self) -> &ModelBasedConfig {
        &self.config
    }

    /// Number of results reported through `tell`.
    pub fn num_told(&self) -> usize {
        self.told
    }

    /// Orient targets so that lower is always better.
    fn oriented(&self, value: f64) -> f64 {
        if self.space.objective().minimize {
            value
        } else {
            -value
        }
    }

    fn training_data(&self, completed: &[CompletedObservation]) -> (Vec<Vec<f64>>, Vec<f64>, Vec<f64>) {
        let mut x = Vec::with_capacity(completed.len());
        let mut y = Vec::with_capacity(completed.len());
        let mut noise = Vec::with_capacity(completed.len());
        for obs in completed {
            match self.space.to_unit(&obs.parameterization) {
                Ok(point) => {
                    x.push(point);
                    y.push(self.oriented(obs.observation.mean));
                    noise.push(obs.observation.variance().unwrap_or(0.0));
                }
                Err(e) => warn!(trial_index = obs.trial_index, error = %e, "skipping unmappable trial"),
            }
        }
        (x, y, noise)
    }

    fn refresh_model(&mut self, completed: &[CompletedObservation]) {
        let stale = self
            .model
            .as_ref()
            .map_or(true, |m| m.num_observations != completed.len());
        if !stale {
            return;
        }
        let (x, y, noise) = self.training_data(completed);
        self.model = GpModel::fit(&x, &y, &noise, self.config.noise_variance).map(|gp| FittedModel {
            gp,
            num_observations: completed.len(),
        });
        if self.model.is_none() {
            warn!(observations = completed.len(), "surrogate fit failed");
        }
    }

    fn candidates(&mut self, incumbent: Option<&[f64]>) -> Vec<Vec<f64>> {
        let dims = self.space.len();
        let n = self.config.num_candidates.max(1);
        let n_local = match incumbent {
            Some(_) => (n as f64 * self.config.local_fraction.clamp(0.0, 1.0)) as usize,
            None => 0,
        };
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let point: Vec<f64> = match incumbent {
                Some(center) if i < n_local => center
                    .iter()
                    .map(|c| (c + self.rng.random_range(-0.1_f64..0.1)).clamp(0.0, 1.0))
                    .collect(),
                _ => (0..dims).map(|_| self.rng.random::<f64>()).collect(),
            };
            out.push(point);
        }
        out
    }

    /// One EI-maximizing proposal given the real data plus fantasies.
    fn propose_from_model(
        &mut self,
        completed: &[CompletedObservation],
        fantasies: &[Vec<f64>],
    ) -> Option<Vec<f64>> {
        let (mut x, mut y, mut noise) = self.training_data(completed);
        let incumbent = x
            .iter()
            .zip(&y)
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(p, _)| p.clone());
        let candidates = self.candidates(incumbent.as_deref());

        self.refresh_model(completed);
        let base = self.model.as_ref()?;

        let fitted;
        let gp = if fantasies.is_empty() {
            &base.gp
        } else {
            for point in fantasies {
                let (mean, _) = base.gp.predict(point);
                x.push(point.clone());
                y.push(mean);
                noise.push(0.0);
            }
            fitted = GpModel::fit(&x, &y, &noise, self.config.noise_variance)?;
            &fitted
        };

        let f_best = gp.f_best();
        let scores: Vec<f64> = candidates
            .par_iter()
            .map(|c| {
                let (mean, std) = gp.predict_standardized(c);
                expected_improvement(mean, std, f_best)
            })
            .collect();

        // First maximum wins so the choice is independent of thread timing.
        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }
        debug!(ei = scores[best], fantasies = fantasies.len(), "acquisition maximized");
        candidates.into_iter().nth(best)
    }
}

impl GenerationStrategy for ModelBasedStrategy {
    fn ask(&mut self, snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome> {
        let n_init = self.config.num_initialization_trials;
        let min_observed = self.config.min_observed();
        let completed = snapshot.completed.len();

        let mut proposals: Vec<Proposal> = Vec::new();
        let mut fantasies: Vec<Vec<f64>> = snapshot
            .pending
            .iter()
            .filter_map(|p| self.space.to_unit(p).ok())
            .collect();

        while proposals.len() < count.max(1) {
            let issued = snapshot.num_trials + proposals.len();
            if issued < n_init {
                proposals.push(self.init.next_proposal());
                continue;
            }
            if completed < min_observed.max(1) {
                if self.config.enforce_sequential_optimization {
                    break;
                }
                proposals.push(self.init.next_proposal());
                continue;
            }
            match self.propose_from_model(&snapshot.completed, &fantasies) {
                Some(point) => {
                    let parameterization = self.space.from_unit(&point);
                    // Store the fantasy at the snapped location actually proposed.
                    if let Ok(snapped) = self.space.to_unit(&parameterization) {
                        fantasies.push(snapped);
                    }
                    proposals.push(Proposal {
                        parameterization,
                        generation_method: "gpei".to_string(),
                    });
                }
                None => {
                    let mut fallback = self.init.next_proposal();
                    fallback.generation_method = "sobol_fallback".to_string();
                    proposals.push(fallback);
                }
            }
        }

        if proposals.is_empty() {
            return Ok(GenerationOutcome::NoProposalYet {
                reason: format!(
                    "waiting for {min_observed} completed initialization trials, have {completed}"
                ),
            });
        }
        Ok(GenerationOutcome::Proposed(proposals))
    }

    fn tell(&mut self, trial_index: usize, result: &Observation) {
        self.told += 1;
        // The fitted model stays available for predictions; the next ask refits
        // once it sees the extra completed observation.
        debug!(trial_index, mean = result.mean, "observation recorded");
    }

    fn predict(&self, points: &[Parameterization]) -> Option<Vec<Prediction>> {
        let model = self.model.as_ref()?;
        points
            .iter()
            .map(|p| {
                let x = self.space.to_unit(p).ok()?;
                let (mean, variance) = model.gp.predict(&x);
                Some(Prediction {
                    mean: self.oriented(mean),
                    variance,
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "sobol+gpei"
    }
}
