//! Uniform random search baseline.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tr_types::{Parameterization, SearchSpace, TrellisResult};

use super::{GenerationOutcome, GenerationStrategy, LedgerSnapshot, Proposal};

/// Independent random sampling across the search space. Log-scale ranges
/// are sampled uniformly in log-space.
///
/// Ignores results entirely; useful as a baseline and for tests.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self) -> Parameterization {
        let point: Vec<f64> = (0..self.space.len())
            .map(|_| self.rng.random::<f64>())
            .collect();
        self.space.from_unit(&point)
    }
}

impl GenerationStrategy for RandomSearch {
    fn ask(&mut self, _snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome> {
        let proposals = (0..count.max(1))
            .map(|_| Proposal {
                parameterization: self.sample_one(),
                generation_method: "random".to_string(),
            })
            .collect();
        Ok(GenerationOutcome::Proposed(proposals))
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tr_types::{Objective, ParameterValue};

    fn sample_space() -> SearchSpace {
        SearchSpace::builder(Objective::minimize("loss"))
            .add_int("batch_exp", 4, 9)
            .add_float("dropout", 0.0, 0.5)
            .add_log_float("lr", 1e-5, 1e-1)
            .add_choice("optimizer", vec![json!("sgd"), json!("adam"), json!("rmsprop")])
            .build()
            .unwrap()
    }

    fn proposals(outcome: GenerationOutcome) -> Vec<Proposal> {
        match outcome {
            GenerationOutcome::Proposed(p) => p,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn random_search_respects_bounds() {
        let space = sample_space();
        let mut rs = RandomSearch::with_seed(space.clone(), 7);
        let batch = proposals(rs.ask(&LedgerSnapshot::default(), 50).unwrap());
        assert_eq!(batch.len(), 50);

        for p in &batch {
            space.validate(&p.parameterization).unwrap();
            match p.parameterization.get("lr") {
                Some(ParameterValue::Float(v)) => assert!(*v >= 1e-5 && *v <= 1e-1),
                other => panic!("unexpected lr value: {other:?}"),
            }
        }
    }

    #[test]
    fn seeded_random_search_is_deterministic() {
        let mut a = RandomSearch::with_seed(sample_space(), 42);
        let mut b = RandomSearch::with_seed(sample_space(), 42);
        let snapshot = LedgerSnapshot::default();
        for _ in 0..5 {
            assert_eq!(a.ask(&snapshot, 2).unwrap(), b.ask(&snapshot, 2).unwrap());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = RandomSearch::with_seed(sample_space(), 1);
        let mut b = RandomSearch::with_seed(sample_space(), 2);
        let snapshot = LedgerSnapshot::default();
        assert_ne!(a.ask(&snapshot, 3).unwrap(), b.ask(&snapshot, 3).unwrap());
    }
}
