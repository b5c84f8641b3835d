//! Runner configuration, read from the file named by `TRELLIS_RUN_CONFIG`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tr_optimizer::{
    GenerationStrategy, ModelBasedConfig, ModelBasedStrategy, QuasiRandomStrategy, RandomSearch,
    RunConfig,
};
use tr_types::SearchSpace;

/// Which generation strategy drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    Sobol,
    SobolGpei,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub experiment_name: String,
    pub strategy: StrategyKind,
    pub run: RunConfig,
    pub model: ModelBasedConfig,
    /// Experiment file. Resumed from when it exists, written after the run.
    pub experiment_path: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            experiment_name: "lr-momentum".to_string(),
            strategy: StrategyKind::SobolGpei,
            run: RunConfig::default(),
            model: ModelBasedConfig::default(),
            experiment_path: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading runner config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing runner config {}", path.display()))?;
        config.run.validate()?;
        Ok(config)
    }

    /// Build the configured strategy. The run seed, when set, overrides the
    /// model seed, and the run's sequential enforcement setting wins over the
    /// model's.
    pub fn build_strategy(&self, space: SearchSpace) -> Box<dyn GenerationStrategy> {
        let seed = self.run.seed.or(self.model.seed);
        match self.strategy {
            StrategyKind::Random => match seed {
                Some(seed) => Box::new(RandomSearch::with_seed(space, seed)),
                None => Box::new(RandomSearch::new(space)),
            },
            StrategyKind::Sobol => Box::new(QuasiRandomStrategy::with_seed(space, seed.unwrap_or(0))),
            StrategyKind::SobolGpei => {
                let mut model = self.model.clone();
                model.seed = seed;
                model.enforce_sequential_optimization = self.run.enforce_sequential_optimization;
                Box::new(ModelBasedStrategy::new(space, model))
            }
        }
    }
}
