mod config;

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tr_optimizer::{
    create_experiment, AskTellService, Dispatcher, Experiment, FnEvaluator, ProgressReporter,
};
use tr_types::{Observation, ParameterSpec, Parameterization, TrellisError, WorkerFailure};

use crate::config::RunnerConfig;

/// Synthetic training objective: accuracy peaks at `lr = 1e-2`,
/// `momentum = 0.6`, and simulated epochs are reported as progress.
fn train_and_evaluate(
    params: &Parameterization,
    progress: &ProgressReporter,
) -> Result<Observation, WorkerFailure> {
    let lr = params
        .get("lr")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| WorkerFailure::evaluation("lr missing"))?;
    let momentum = params
        .get("momentum")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| WorkerFailure::evaluation("momentum missing"))?;

    let target = 1.0 - (lr.log10() + 2.0).powi(2) / 20.0 - (momentum - 0.6).powi(2);
    let epochs = 5;
    for epoch in 1..=epochs {
        progress.report(epoch, target * epoch as f64 / epochs as f64);
    }
    Ok(Observation::new(target))
}

fn new_experiment(name: &str) -> anyhow::Result<Experiment> {
    Ok(create_experiment(
        name,
        vec![
            ParameterSpec::log_float("lr", 1e-6, 0.4),
            ParameterSpec::float("momentum", 0.0, 1.0),
        ],
        "accuracy",
        false,
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("TRELLIS_RUN_CONFIG") {
        Ok(path) => RunnerConfig::from_json_file(&path)?,
        Err(_) => RunnerConfig::default(),
    };

    let resumed = match &config.experiment_path {
        Some(path) if path.exists() => Some(
            Experiment::load_json(path)
                .with_context(|| format!("loading experiment {}", path.display()))?,
        ),
        _ => None,
    };
    let service = match resumed {
        Some(experiment) => {
            info!(experiment = %experiment.name(), trials = experiment.num_trials(), "resuming");
            let strategy = config.build_strategy(experiment.search_space().clone());
            AskTellService::resume(experiment, strategy, config.run.effective_max_concurrent())?
        }
        None => {
            let experiment = new_experiment(&config.experiment_name)?;
            let strategy = config.build_strategy(experiment.search_space().clone());
            AskTellService::from_config(experiment, strategy, &config.run)
        }
    };
    let service = Arc::new(service);

    let mut dispatcher = Dispatcher::with_service(
        Arc::clone(&service),
        FnEvaluator::new(train_and_evaluate),
        config.run.clone(),
    )?;

    let cancel = dispatcher.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; letting in-flight trials finish");
            cancel.stop();
        }
    });

    let result = dispatcher.run().await;

    if let Some(path) = &config.experiment_path {
        let experiment = service.experiment();
        let experiment = experiment.read();
        experiment
            .save_json(path)
            .with_context(|| format!("saving experiment {}", path.display()))?;
    }

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(TrellisError::RunAborted {
            failed,
            finished,
            best_so_far,
            ..
        }) => {
            if let Some(best) = best_so_far {
                println!("{}", serde_json::to_string_pretty(&best)?);
            }
            anyhow::bail!("run aborted after {failed} of {finished} trials failed")
        }
        Err(e) => Err(e.into()),
    }
}
