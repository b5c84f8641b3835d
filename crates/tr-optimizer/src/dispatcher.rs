//! The run loop: ask for trials, hand them to workers, tell the results.
//!
//! A single control task owns the loop. Each evaluation runs in its own tokio
//! task wrapped by a supervisor task in a [`JoinSet`]; the supervisor applies
//! the per-trial timeout and turns panics and cancellation into
//! [`WorkerFailure`]s so the control task only ever sees `(index, outcome)`.

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use tr_types::{
    BestPoint, Observation, Parameterization, TrellisError, TrellisResult, WorkerFailure,
};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::experiment::Experiment;
use crate::selector::ResultSummary;
use crate::service::{AskResponse, AskTellService, TrialOutcome};
use crate::strategy::GenerationStrategy;
use crate::telemetry::{RunCompletedRecord, RunCreatedRecord};
use crate::trial::TrialStatus;
use crate::worker::{join_failure, Evaluator, ProgressReporter, ProgressUpdate, TrialTask};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// All `num_trials` trials were issued and have finished.
    Completed,
    /// A stop was requested; in-flight trials were allowed to finish.
    Stopped,
    /// The failure-rate check tripped.
    Aborted,
}

/// Final report of a successful or stopped run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub state: RunState,
    pub summary: ResultSummary,
    pub best: Option<BestPoint>,
    pub created: RunCreatedRecord,
    pub completed: RunCompletedRecord,
    /// Most recent progress update per trial.
    pub last_progress: BTreeMap<usize, ProgressUpdate>,
}

#[derive(Debug)]
enum Command {
    Abandon(usize),
    Stop,
}

/// Cancels trials or the whole run from outside the run loop.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CancelHandle {
    /// Abandon one trial. Its worker is aborted and any late result is
    /// ignored. Returns false once the dispatcher is gone.
    pub fn abandon_trial(&self, trial_index: usize) -> bool {
        self.commands.send(Command::Abandon(trial_index)).is_ok()
    }

    /// Stop issuing new trials. Trials already in flight run to completion.
    pub fn stop(&self) -> bool {
        self.commands.send(Command::Stop).is_ok()
    }
}

struct InFlight {
    worker: AbortHandle,
    started: Instant,
}

enum Event {
    Finished(Option<Result<(usize, Result<Observation, WorkerFailure>), JoinError>>),
    Command(Option<Command>),
}

/// Mutable state of one `run` call.
#[derive(Default)]
struct RunProgress {
    workers: JoinSet<(usize, Result<Observation, WorkerFailure>)>,
    in_flight: HashMap<usize, InFlight>,
    issued: usize,
    completed: usize,
    failed: usize,
    bad_due_to_err: usize,
    empty_polls: usize,
    stopping: bool,
    last_progress: BTreeMap<usize, ProgressUpdate>,
}

impl RunProgress {
    fn failure_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

pub struct Dispatcher<S: GenerationStrategy, E: Evaluator> {
    service: Arc<AskTellService<S>>,
    evaluator: Arc<E>,
    config: RunConfig,
    experiment_id: Uuid,
    experiment_name: String,
    objective_name: String,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    progress_tx: Sender<ProgressUpdate>,
    progress_rx: Receiver<ProgressUpdate>,
}

impl<S: GenerationStrategy, E: Evaluator> Dispatcher<S, E> {
    pub fn new(experiment: Experiment, strategy: S, evaluator: E, config: RunConfig) -> TrellisResult<Self> {
        config.validate()?;
        let service = Arc::new(AskTellService::from_config(experiment, strategy, &config));
        Self::with_service(service, evaluator, config)
    }

    /// Drive an existing service, e.g. one built with
    /// [`AskTellService::resume`].
    pub fn with_service(
        service: Arc<AskTellService<S>>,
        evaluator: E,
        config: RunConfig,
    ) -> TrellisResult<Self> {
        config.validate()?;
        let (experiment_id, experiment_name, objective_name) = {
            let experiment = service.experiment();
            let experiment = experiment.read();
            (
                experiment.id(),
                experiment.name().to_string(),
                experiment.objective().name.clone(),
            )
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            service,
            evaluator: Arc::new(evaluator),
            config,
            experiment_id,
            experiment_name,
            objective_name,
            commands_tx,
            commands_rx,
            progress_tx,
            progress_rx,
        })
    }

    pub fn service(&self) -> Arc<AskTellService<S>> {
        Arc::clone(&self.service)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Run until `num_trials` trials have been issued and finished, a stop is
    /// requested, or the failure rate trips.
    ///
    /// A tripped failure rate returns [`TrellisError::RunAborted`] carrying
    /// the best point so far. Every other trial-level failure is recorded in
    /// the ledger and the run continues.
    pub async fn run(&mut self) -> TrellisResult<RunReport> {
        let started = Instant::now();
        let strategy_name = self.service.strategy_name();
        let created = {
            let experiment = self.service.experiment();
            let experiment = experiment.read();
            RunCreatedRecord::new(&experiment, &strategy_name, &self.config)
        };
        info!(
            experiment = %self.experiment_name,
            strategy = %strategy_name,
            record = %serde_json::Value::Object(created.flatten()),
            "run created"
        );

        let mut run = RunProgress::default();
        let result = self.drive(&mut run).await;
        self.abandon_in_flight(&mut run, "run ended before the trial finished");
        self.drain_progress(&mut run);

        let best = self.service.best_parameters().ok();
        let state = match &result {
            Ok(state) => *state,
            Err(_) => RunState::Aborted,
        };
        let completed = {
            let experiment = self.service.experiment();
            let experiment = experiment.read();
            RunCompletedRecord::new(
                &experiment,
                state,
                run.bad_due_to_err,
                best.as_ref(),
                started.elapsed().as_secs_f64(),
            )
        };
        info!(
            experiment = %self.experiment_name,
            state = ?state,
            record = %serde_json::Value::Object(completed.flatten()),
            "run finished"
        );

        match result {
            Err(e) => {
                error!(experiment = %self.experiment_name, error = %e, "run failed");
                Err(e)
            }
            Ok(RunState::Aborted) => Err(TrellisError::RunAborted {
                failed: run.failed,
                finished: run.completed + run.failed,
                failure_rate: run.failure_rate(),
                max_failure_rate: self.config.max_failure_rate,
                best_so_far: best.map(Box::new),
            }),
            Ok(state) => Ok(RunReport {
                state,
                summary: self.service.summary(),
                best,
                created,
                completed,
                last_progress: run.last_progress,
            }),
        }
    }

    async fn drive(&mut self, run: &mut RunProgress) -> TrellisResult<RunState> {
        loop {
            while let Ok(command) = self.commands_rx.try_recv() {
                self.handle_command(run, command);
            }
            self.drain_progress(run);
            if !run.stopping {
                self.fill_slots(run)?;
            }

            if run.workers.is_empty() {
                if run.stopping {
                    return Ok(RunState::Stopped);
                }
                if run.issued >= self.config.num_trials {
                    return Ok(RunState::Completed);
                }
                run.empty_polls += 1;
                if run.empty_polls > self.config.max_pending_polls {
                    return Err(TrellisError::GenerationStalled {
                        attempts: self.config.max_pending_polls,
                    });
                }
                let wait = self.config.poll_interval(run.empty_polls);
                debug!(
                    polls = run.empty_polls,
                    wait_seconds = wait.as_secs_f64(),
                    "nothing in flight and no proposal; backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let event = tokio::select! {
                joined = run.workers.join_next() => Event::Finished(joined),
                command = self.commands_rx.recv() => Event::Command(command),
            };
            match event {
                Event::Finished(Some(Ok((trial_index, outcome)))) => {
                    if self.record_outcome(run, trial_index, outcome)? {
                        return Ok(RunState::Aborted);
                    }
                }
                Event::Finished(Some(Err(e))) => {
                    error!(error = %e, "trial supervisor task failed");
                }
                Event::Finished(None) | Event::Command(None) => {}
                Event::Command(Some(command)) => self.handle_command(run, command),
            }
        }
    }

    /// Issue trials until the service says wait or the budget is spent.
    fn fill_slots(&self, run: &mut RunProgress) -> TrellisResult<()> {
        while run.issued < self.config.num_trials {
            match self.service.ask()? {
                AskResponse::Trial {
                    trial_index,
                    parameterization,
                } => {
                    self.spawn_trial(run, trial_index, parameterization);
                    run.issued += 1;
                    run.empty_polls = 0;
                }
                AskResponse::Wait { .. } => break,
            }
        }
        Ok(())
    }

    fn spawn_trial(&self, run: &mut RunProgress, trial_index: usize, parameterization: Parameterization) {
        let task = TrialTask {
            experiment_id: self.experiment_id,
            experiment_name: self.experiment_name.clone(),
            trial_index,
            parameterization,
            objective_name: self.objective_name.clone(),
            resources: self.config.worker_resources.clone(),
            dispatched_at: Utc::now(),
        };
        let progress = ProgressReporter::new(trial_index, self.progress_tx.clone());
        let evaluator = Arc::clone(&self.evaluator);
        let worker = tokio::spawn(async move { evaluator.evaluate(task, progress).await });
        let abort = worker.abort_handle();

        let timeout = self.config.trial_timeout();
        run.workers.spawn(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, worker).await {
                    Ok(joined) => flatten_join(joined),
                    Err(_) => Err(WorkerFailure::Timeout {
                        seconds: limit.as_secs_f64(),
                    }),
                },
                None => flatten_join(worker.await),
            };
            (trial_index, outcome)
        });
        run.in_flight.insert(
            trial_index,
            InFlight {
                worker: abort,
                started: Instant::now(),
            },
        );
        debug!(trial = trial_index, in_flight = run.in_flight.len(), "trial dispatched");
    }

    /// Record a worker's outcome. Returns true when the failure rate trips.
    fn record_outcome(
        &self,
        run: &mut RunProgress,
        trial_index: usize,
        outcome: Result<Observation, WorkerFailure>,
    ) -> TrellisResult<bool> {
        let Some(flight) = run.in_flight.remove(&trial_index) else {
            debug!(trial = trial_index, "ignoring result of abandoned trial");
            return Ok(false);
        };
        // A timed-out worker is still running; stop it.
        flight.worker.abort();
        let seconds = flight.started.elapsed().as_secs_f64();

        let (status, worker_error) = match outcome {
            Ok(obs) => (
                self.service.tell(trial_index, TrialOutcome::Completed(obs))?,
                false,
            ),
            Err(failure) => {
                warn!(trial = trial_index, error = %failure, seconds, "trial failed");
                (
                    self.service
                        .tell(trial_index, TrialOutcome::Failed(failure.to_string()))?,
                    true,
                )
            }
        };
        match status {
            TrialStatus::Completed => {
                run.completed += 1;
                info!(trial = trial_index, seconds, "trial completed");
            }
            TrialStatus::Failed => {
                run.failed += 1;
                if worker_error {
                    run.bad_due_to_err += 1;
                }
            }
            _ => {}
        }
        Ok(self.failure_rate_exceeded(run))
    }

    fn failure_rate_exceeded(&self, run: &RunProgress) -> bool {
        if run.failed <= self.config.min_failed_trials_for_failure_rate_check {
            return false;
        }
        let rate = run.failure_rate();
        if rate > self.config.max_failure_rate {
            error!(
                experiment = %self.experiment_name,
                failed = run.failed,
                finished = run.completed + run.failed,
                failure_rate = rate,
                max_failure_rate = self.config.max_failure_rate,
                "failure rate exceeded; aborting run"
            );
            true
        } else {
            false
        }
    }

    fn handle_command(&self, run: &mut RunProgress, command: Command) {
        match command {
            Command::Stop => {
                if !run.stopping {
                    info!(
                        experiment = %self.experiment_name,
                        in_flight = run.in_flight.len(),
                        "stop requested"
                    );
                }
                run.stopping = true;
            }
            Command::Abandon(trial_index) => {
                if let Some(flight) = run.in_flight.remove(&trial_index) {
                    flight.worker.abort();
                }
                match self.service.abandon(trial_index, "cancelled") {
                    Ok(transition) if transition.is_applied() => {
                        info!(trial = trial_index, "trial abandoned");
                    }
                    Ok(_) => debug!(trial = trial_index, "abandon ignored; trial already finished"),
                    Err(e) => warn!(trial = trial_index, error = %e, "cannot abandon trial"),
                }
            }
        }
    }

    fn abandon_in_flight(&self, run: &mut RunProgress, reason: &str) {
        for (trial_index, flight) in run.in_flight.drain() {
            flight.worker.abort();
            if let Err(e) = self.service.abandon(trial_index, reason) {
                warn!(trial = trial_index, error = %e, "cannot abandon trial");
            } else {
                warn!(trial = trial_index, %reason, "trial abandoned");
            }
        }
        run.workers.abort_all();
    }

    fn drain_progress(&self, run: &mut RunProgress) {
        for update in self.progress_rx.try_iter() {
            debug!(
                trial = update.trial_index,
                step = update.step,
                value = ?update.value,
                "trial progress"
            );
            run.last_progress.insert(update.trial_index, update);
        }
    }
}

fn flatten_join(
    joined: Result<Result<Observation, WorkerFailure>, JoinError>,
) -> Result<Observation, WorkerFailure> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(join_failure(e)),
    }
}
