//! Thread-safe ask/tell facade over an experiment and its strategy.
//!
//! Lock order is always strategy (limiter mutex) first, experiment second.
//! `tell` holds the strategy lock across the ledger update and the strategy
//! notification, so no `ask` can see a ledger result its strategy has not
//! been told about.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tr_types::{BestPoint, Observation, Parameterization, TrellisError, TrellisResult};

use crate::config::RunConfig;
use crate::experiment::Experiment;
use crate::ledger::{StatusCounts, Transition};
use crate::limiter::ConcurrencyLimiter;
use crate::selector::{ResultSelector, ResultSummary};
use crate::strategy::{GenerationOutcome, GenerationStrategy, LedgerSnapshot};
use crate::trial::TrialStatus;

/// Answer to [`AskTellService::ask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AskResponse {
    /// A new RUNNING trial to evaluate.
    Trial {
        trial_index: usize,
        parameterization: Parameterization,
    },
    /// Nothing can be issued right now; retry after a result arrives.
    Wait { reason: String },
}

/// What a worker reports for a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Completed(Observation),
    Failed(String),
}

pub struct AskTellService<S: GenerationStrategy> {
    experiment: Arc<RwLock<Experiment>>,
    limiter: Mutex<ConcurrencyLimiter<S>>,
}

impl<S: GenerationStrategy> AskTellService<S> {
    pub fn new(experiment: Experiment, strategy: S, max_concurrent: Option<usize>) -> Self {
        info!(
            experiment = %experiment.name(),
            strategy = strategy.name(),
            max_concurrent = ?max_concurrent,
            "ask/tell service ready"
        );
        Self {
            experiment: Arc::new(RwLock::new(experiment)),
            limiter: Mutex::new(ConcurrencyLimiter::new(strategy, max_concurrent)),
        }
    }

    pub fn from_config(experiment: Experiment, strategy: S, config: &RunConfig) -> Self {
        Self::new(experiment, strategy, config.effective_max_concurrent())
    }

    /// Attach a strategy to an experiment that already has trials. COMPLETED
    /// results are replayed into the strategy in index order, and anything
    /// still pending is abandoned since its worker is gone.
    pub fn resume(
        mut experiment: Experiment,
        mut strategy: S,
        max_concurrent: Option<usize>,
    ) -> TrellisResult<Self> {
        let abandoned = experiment.abandon_pending("abandoned on resume")?;
        if !abandoned.is_empty() {
            warn!(trials = ?abandoned, "abandoned pending trials on resume");
        }
        let mut replayed = 0;
        for trial in experiment.completed_trials() {
            if let Some(obs) = trial.result() {
                strategy.tell(trial.index(), obs);
                replayed += 1;
            }
        }
        info!(experiment = %experiment.name(), replayed, "resumed experiment");
        Ok(Self::new(experiment, strategy, max_concurrent))
    }

    /// Shared handle to the experiment. Hold the read lock briefly; writers
    /// are the service's own operations.
    pub fn experiment(&self) -> Arc<RwLock<Experiment>> {
        Arc::clone(&self.experiment)
    }

    pub fn strategy_name(&self) -> String {
        self.limiter.lock().strategy().name().to_string()
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.limiter.lock().max_concurrent()
    }

    pub fn running_count(&self) -> usize {
        self.experiment.read().running_count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.experiment.read().status_counts()
    }

    pub fn trial_status(&self, trial_index: usize) -> TrellisResult<TrialStatus> {
        Ok(self.experiment.read().trial(trial_index)?.status())
    }

    pub fn has_capacity(&self) -> bool {
        let limiter = self.limiter.lock();
        let running = self.experiment.read().running_count();
        limiter.has_capacity(running)
    }

    /// Request the next trial. On success the trial is already RUNNING.
    pub fn ask(&self) -> TrellisResult<AskResponse> {
        let mut limiter = self.limiter.lock();
        let snapshot = LedgerSnapshot::capture(&self.experiment.read());

        let proposal = match limiter.ask(&snapshot, 1)? {
            GenerationOutcome::Proposed(mut proposals) if !proposals.is_empty() => {
                proposals.swap_remove(0)
            }
            GenerationOutcome::Proposed(_) => {
                return Err(TrellisError::Internal(format!(
                    "strategy {} proposed an empty batch",
                    limiter.strategy().name()
                )))
            }
            GenerationOutcome::NoProposalYet { reason } => {
                debug!(%reason, "no proposal yet");
                return Ok(AskResponse::Wait { reason });
            }
        };

        let mut experiment = self.experiment.write();
        let trial_index =
            experiment.create_trial(proposal.parameterization.clone(), &proposal.generation_method)?;
        experiment.mark_running(trial_index)?;
        debug!(
            trial = trial_index,
            method = %proposal.generation_method,
            running = experiment.running_count(),
            "trial issued"
        );
        Ok(AskResponse::Trial {
            trial_index,
            parameterization: proposal.parameterization,
        })
    }

    /// Wait until the concurrency limiter has a free slot.
    pub async fn acquire(&self) {
        loop {
            let signal = self.limiter.lock().slot_signal();
            let notified = signal.notified();
            if self.has_capacity() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`ask`](Self::ask), but waits through `Wait` answers as long as
    /// some trial is RUNNING and could free a slot or add data.
    pub async fn next_trial(&self) -> TrellisResult<(usize, Parameterization)> {
        loop {
            self.acquire().await;
            let signal = self.limiter.lock().slot_signal();
            let notified = signal.notified();
            match self.ask()? {
                AskResponse::Trial {
                    trial_index,
                    parameterization,
                } => return Ok((trial_index, parameterization)),
                AskResponse::Wait { reason } => {
                    if self.running_count() == 0 {
                        warn!(%reason, "strategy is waiting but nothing is running");
                        return Err(TrellisError::GenerationStalled { attempts: 1 });
                    }
                    notified.await;
                }
            }
        }
    }

    /// Report a trial's outcome. Reporting on an already-terminal trial is a
    /// no-op; the returned status is the trial's status afterwards.
    ///
    /// A completed observation with a non-finite mean is recorded as a
    /// failure.
    pub fn tell(&self, trial_index: usize, outcome: TrialOutcome) -> TrellisResult<TrialStatus> {
        let mut limiter = self.limiter.lock();
        let (transition, status, told) = {
            let mut experiment = self.experiment.write();
            let (transition, told) = match outcome {
                TrialOutcome::Completed(obs) if obs.mean.is_finite() => {
                    (experiment.complete_trial(trial_index, obs)?, Some(obs))
                }
                TrialOutcome::Completed(obs) => {
                    warn!(trial = trial_index, mean = obs.mean, "non-finite objective");
                    let reason = format!("non-finite objective value {}", obs.mean);
                    (experiment.fail_trial(trial_index, &reason)?, None)
                }
                TrialOutcome::Failed(reason) => (experiment.fail_trial(trial_index, &reason)?, None),
            };
            (transition, experiment.trial(trial_index)?.status(), told)
        };

        if transition.is_applied() {
            if let Some(obs) = told {
                limiter.tell(trial_index, &obs);
            }
        }
        if transition.released_running() {
            limiter.release();
        }
        Ok(status)
    }

    /// Abandon a CANDIDATE or RUNNING trial. A no-op on terminal trials.
    pub fn abandon(&self, trial_index: usize, reason: &str) -> TrellisResult<Transition> {
        let mut limiter = self.limiter.lock();
        let transition = self.experiment.write().abandon_trial(trial_index, reason)?;
        if transition.released_running() {
            limiter.release();
        }
        Ok(transition)
    }

    /// Best COMPLETED trial, using the strategy's model when it has one.
    pub fn best_parameters(&self) -> TrellisResult<BestPoint> {
        let limiter = self.limiter.lock();
        let experiment = self.experiment.read();
        ResultSelector::new(&experiment)
            .with_model(limiter.strategy())
            .best_parameters()
    }

    pub fn summary(&self) -> ResultSummary {
        ResultSelector::new(&self.experiment.read()).summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::create_experiment;
    use crate::strategy::{ModelBasedConfig, ModelBasedStrategy, QuasiRandomStrategy};
    use std::time::Duration;
    use tr_types::ParameterSpec;

    fn experiment() -> Experiment {
        create_experiment(
            "service",
            vec![
                ParameterSpec::log_float("lr", 1e-6, 0.4),
                ParameterSpec::float("momentum", 0.0, 1.0),
            ],
            "accuracy",
            false,
        )
        .unwrap()
    }

    fn accuracy(p: &Parameterization) -> f64 {
        let lr = p["lr"].as_f64().unwrap_or(0.0);
        let momentum = p["momentum"].as_f64().unwrap_or(0.0);
        1.0 - (lr.log10() + 2.0).powi(2) / 20.0 - (momentum - 0.6).powi(2)
    }

    fn issued(response: AskResponse) -> (usize, Parameterization) {
        match response {
            AskResponse::Trial {
                trial_index,
                parameterization,
            } => (trial_index, parameterization),
            other => panic!("expected a trial, got {other:?}"),
        }
    }

    #[test]
    fn ask_marks_trial_running() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), None);
        let (index, params) = issued(service.ask().unwrap());
        assert_eq!(index, 0);
        assert_eq!(service.trial_status(0).unwrap(), TrialStatus::Running);
        assert_eq!(service.running_count(), 1);
        service.experiment().read().search_space().validate(&params).unwrap();
    }

    #[test]
    fn limiter_blocks_until_tell() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), Some(2));

        let (a, pa) = issued(service.ask().unwrap());
        let (_b, _) = issued(service.ask().unwrap());
        assert!(matches!(service.ask().unwrap(), AskResponse::Wait { .. }));
        assert!(!service.has_capacity());

        let status = service
            .tell(a, TrialOutcome::Completed(Observation::new(accuracy(&pa))))
            .unwrap();
        assert_eq!(status, TrialStatus::Completed);
        assert!(service.has_capacity());
        issued(service.ask().unwrap());
        assert_eq!(service.running_count(), 2);
    }

    #[test]
    fn duplicate_tell_is_a_noop_and_releases_once() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), Some(1));
        let (a, _) = issued(service.ask().unwrap());

        service.tell(a, TrialOutcome::Completed(Observation::new(0.5))).unwrap();
        let status = service.tell(a, TrialOutcome::Failed("late".into())).unwrap();
        assert_eq!(status, TrialStatus::Completed);
        assert_eq!(service.limiter.lock().releases(), 1);

        let transition = service.abandon(a, "too late").unwrap();
        assert!(!transition.is_applied());
        assert_eq!(service.limiter.lock().releases(), 1);
    }

    #[test]
    fn non_finite_result_is_a_failure() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), None);
        let (a, _) = issued(service.ask().unwrap());
        let status = service
            .tell(a, TrialOutcome::Completed(Observation::new(f64::NAN)))
            .unwrap();
        assert_eq!(status, TrialStatus::Failed);
        assert!(matches!(
            service.best_parameters(),
            Err(TrellisError::NoCompletedTrials)
        ));
    }

    #[test]
    fn abandon_frees_slot() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), Some(1));
        let (a, _) = issued(service.ask().unwrap());
        assert!(service.abandon(a, "cancelled").unwrap().released_running());
        assert_eq!(service.trial_status(a).unwrap(), TrialStatus::Abandoned);
        issued(service.ask().unwrap());
    }

    #[test]
    fn unknown_trial_is_rejected() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = AskTellService::new(exp, QuasiRandomStrategy::with_seed(space, 1), None);
        assert!(matches!(
            service.tell(7, TrialOutcome::Failed("x".into())),
            Err(TrellisError::TrialNotFound { trial_index: 7 })
        ));
    }

    #[test]
    fn sequential_optimization_waits_for_initialization_data() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let strategy = ModelBasedStrategy::new(
            space,
            ModelBasedConfig::default()
                .with_initialization_trials(5)
                .with_seed(9),
        );
        let service = AskTellService::new(exp, strategy, None);

        let mut first = Vec::new();
        for _ in 0..5 {
            first.push(issued(service.ask().unwrap()));
        }
        assert!(matches!(service.ask().unwrap(), AskResponse::Wait { .. }));

        // Three of five (ceil(5/2)) results unlock model-based generation.
        for (index, params) in first.iter().take(3) {
            service
                .tell(*index, TrialOutcome::Completed(Observation::new(accuracy(params))))
                .unwrap();
        }
        let (index, _) = issued(service.ask().unwrap());
        let method = service.experiment().read().trial(index).unwrap().generation_method().to_string();
        assert_eq!(method, "gpei");
    }

    #[test]
    fn best_point_uses_model_after_sequential_run() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let strategy = ModelBasedStrategy::new(
            space,
            ModelBasedConfig::default()
                .with_initialization_trials(3)
                .with_seed(1),
        );
        let service = AskTellService::new(exp, strategy, Some(1));

        for _ in 0..8 {
            let (index, params) = issued(service.ask().unwrap());
            service
                .tell(index, TrialOutcome::Completed(Observation::new(accuracy(&params))))
                .unwrap();
        }
        let best = service.best_parameters().unwrap();
        assert!(best.model_predicted);
        assert!(best.mean.is_finite());
    }

    #[tokio::test]
    async fn next_trial_waits_for_a_slot() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let service = Arc::new(AskTellService::new(
            exp,
            QuasiRandomStrategy::with_seed(space, 4),
            Some(1),
        ));
        let (first, _) = service.next_trial().await.unwrap();

        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.next_trial().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        service
            .tell(first, TrialOutcome::Completed(Observation::new(0.1)))
            .unwrap();
        let (second, _) = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn next_trial_stalls_when_nothing_runs() {
        let exp = experiment();
        let space = exp.search_space().clone();
        let strategy = ModelBasedStrategy::new(
            space,
            ModelBasedConfig::default().with_initialization_trials(1),
        );
        let service = AskTellService::new(exp, strategy, None);
        let (a, _) = service.next_trial().await.unwrap();
        service.abandon(a, "gone").unwrap();
        assert!(matches!(
            service.next_trial().await,
            Err(TrellisError::GenerationStalled { .. })
        ));
    }

    #[test]
    fn resume_replays_completed_results() {
        let mut exp = experiment();
        let space = exp.search_space().clone();
        let mut seed_strategy = QuasiRandomStrategy::with_seed(space.clone(), 2);
        let snapshot = LedgerSnapshot::default();
        if let GenerationOutcome::Proposed(batch) = seed_strategy.ask(&snapshot, 4).unwrap() {
            for (i, p) in batch.into_iter().enumerate() {
                let index = exp.create_trial(p.parameterization.clone(), "sobol").unwrap();
                exp.mark_running(index).unwrap();
                if i < 3 {
                    exp.complete_trial(index, Observation::new(accuracy(&p.parameterization)))
                        .unwrap();
                }
            }
        }

        let strategy = ModelBasedStrategy::new(space, ModelBasedConfig::default().with_seed(1));
        let service = AskTellService::resume(exp, strategy, None).unwrap();
        assert_eq!(service.limiter.lock().strategy().num_told(), 3);
        assert_eq!(service.trial_status(3).unwrap(), TrialStatus::Abandoned);
        assert_eq!(service.running_count(), 0);
    }
}
