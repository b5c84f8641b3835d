//! Quasi-random generation from a scrambled Sobol sequence.

use sobol_burley::sample;
use tr_types::{SearchSpace, TrellisResult};

use super::{GenerationOutcome, GenerationStrategy, LedgerSnapshot, Proposal};

/// Dimensions provided by the Sobol tables; higher dimensions are folded back
/// with a different scramble seed.
const SOBOL_DIMENSIONS: usize = 256;

/// One point of the scrambled Sobol sequence in `[0, 1)^dims`.
pub(crate) fn sobol_point(index: u32, dims: usize, seed: u32) -> Vec<f64> {
    (0..dims)
        .map(|d| {
            let fold = (d / SOBOL_DIMENSIONS) as u32;
            let scramble = seed.wrapping_add(fold.wrapping_mul(0x9E37_79B9));
            f64::from(sample(index, (d % SOBOL_DIMENSIONS) as u32, scramble))
        })
        .collect()
}

/// Space-filling proposals from a scrambled Sobol sequence (Burley 2020).
///
/// Fully deterministic for a given seed: the n-th proposal is always the n-th
/// Sobol point.
#[derive(Debug, Clone)]
pub struct QuasiRandomStrategy {
    space: SearchSpace,
    seed: u32,
    next_index: u32,
}

impl QuasiRandomStrategy {
    pub fn new(space: SearchSpace) -> Self {
        Self::with_seed(space, 0)
    }

    pub fn with_seed(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            seed: (seed ^ (seed >> 32)) as u32,
            next_index: 0,
        }
    }

    /// Number of points drawn so far.
    pub fn generated(&self) -> usize {
        self.next_index as usize
    }

    pub(crate) fn next_proposal(&mut self) -> Proposal {
        let point = sobol_point(self.next_index, self.space.len(), self.seed);
        self.next_index = self.next_index.wrapping_add(1);
        Proposal {
            parameterization: self.space.from_unit(&point),
            generation_method: "sobol".to_string(),
        }
    }
}

impl GenerationStrategy for QuasiRandomStrategy {
    fn ask(&mut self, _snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome> {
        let proposals = (0..count.max(1)).map(|_| self.next_proposal()).collect();
        Ok(GenerationOutcome::Proposed(proposals))
    }

    fn name(&self) -> &str {
        "sobol"
    }
}
