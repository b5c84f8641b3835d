//! Run configuration for the dispatcher and the ask/tell service.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tr_types::{config_error, TrellisResult};

use crate::worker::WorkerResources;

/// Settings for one optimization run.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Total trials to dispatch, including any that fail or are abandoned.
    pub num_trials: usize,

    /// Maximum RUNNING trials at once. `None` is unbounded.
    pub max_concurrent: Option<usize>,

    /// When false, the concurrency limit is ignored and proposals are issued
    /// as fast as they are requested.
    pub enforce_sequential_optimization: bool,

    /// Abort once more than this fraction of finished trials have failed.
    pub max_failure_rate: f64,

    /// The failure rate is only checked after this many failures.
    pub min_failed_trials_for_failure_rate_check: usize,

    /// Per-trial wall-clock limit in seconds; exceeding it fails the trial.
    pub trial_timeout_seconds: Option<f64>,

    /// First wait when the strategy has nothing to propose and nothing is
    /// in flight.
    pub init_seconds_between_polls: f64,
    pub seconds_between_polls_backoff_factor: f64,
    pub max_seconds_between_polls: f64,

    /// Consecutive empty polls with nothing in flight before giving up.
    pub max_pending_polls: usize,

    /// Seed for strategies built from this config.
    pub seed: Option<u64>,

    /// Resources attached to every dispatched task.
    pub worker_resources: WorkerResources,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_trials: 20,
            max_concurrent: Some(3),
            enforce_sequential_optimization: true,
            max_failure_rate: 0.5,
            min_failed_trials_for_failure_rate_check: 5,
            trial_timeout_seconds: None,
            init_seconds_between_polls: 0.1,
            seconds_between_polls_backoff_factor: 1.5,
            max_seconds_between_polls: 10.0,
            max_pending_polls: 20,
            seed: None,
            worker_resources: WorkerResources::default(),
        }
    }
}

impl RunConfig {
    pub fn with_num_trials(mut self, num_trials: usize) -> Self {
        self.num_trials = num_trials;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: Option<usize>) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_sequential_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_sequential_optimization = enforce;
        self
    }

    pub fn with_failure_policy(mut self, max_failure_rate: f64, min_failed_trials: usize) -> Self {
        self.max_failure_rate = max_failure_rate;
        self.min_failed_trials_for_failure_rate_check = min_failed_trials;
        self
    }

    pub fn with_trial_timeout(mut self, seconds: f64) -> Self {
        self.trial_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> TrellisResult<()> {
        if self.num_trials == 0 {
            return Err(config_error!("num_trials must be positive"));
        }
        if self.max_concurrent == Some(0) {
            return Err(config_error!("max_concurrent must be positive or unset"));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(config_error!(
                "max_failure_rate must be in [0, 1], got {}",
                self.max_failure_rate
            ));
        }
        if let Some(t) = self.trial_timeout_seconds {
            if !(t.is_finite() && t > 0.0) {
                return Err(config_error!("trial_timeout_seconds must be positive, got {t}"));
            }
        }
        if !(self.init_seconds_between_polls.is_finite() && self.init_seconds_between_polls > 0.0) {
            return Err(config_error!("init_seconds_between_polls must be positive"));
        }
        if self.seconds_between_polls_backoff_factor < 1.0 {
            return Err(config_error!("seconds_between_polls_backoff_factor must be at least 1"));
        }
        if self.max_seconds_between_polls < self.init_seconds_between_polls {
            return Err(config_error!(
                "max_seconds_between_polls must not be below init_seconds_between_polls"
            ));
        }
        if self.max_pending_polls == 0 {
            return Err(config_error!("max_pending_polls must be positive"));
        }
        Ok(())
    }

    /// The limit the concurrency limiter should enforce.
    pub fn effective_max_concurrent(&self) -> Option<usize> {
        if self.enforce_sequential_optimization {
            self.max_concurrent
        } else {
            None
        }
    }

    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_seconds.map(Duration::from_secs_f64)
    }

    /// Poll interval after `polls` consecutive empty polls.
    pub fn poll_interval(&self, polls: usize) -> Duration {
        let exponent = polls.saturating_sub(1).min(i32::MAX as usize) as i32;
        let seconds = self.init_seconds_between_polls
            * self.seconds_between_polls_backoff_factor.powi(exponent);
        Duration::from_secs_f64(seconds.min(self.max_seconds_between_polls))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TrellisResult<Self> {
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}
