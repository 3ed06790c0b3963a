//! `drover run` and `drover replay`: drive the target through a suite.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_core::{
    Agent, ArtifactStore, AttemptOutcome, ReplayScenario, RunSummary, Scenario, ScenarioRunner,
};

use crate::config::DroverConfig;
use crate::{logging, scenarios};

/// Exit code when any attempt failed.
pub const EXIT_FAILED: i32 = 1;
/// Exit code when the run was interrupted.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run the selected scenarios `config.repeat` times.
pub async fn run_suite(mut config: DroverConfig, names: &[String], random_seed: bool) -> Result<i32> {
    if random_seed && config.agent.seed.is_none() {
        config.agent.seed = Some(u64::from(rand::random::<u32>()));
    }

    let selection = if names.is_empty() {
        config.scenarios.clone()
    } else {
        names.to_vec()
    };
    let suite = scenarios::select(&selection)?;

    let artifacts = prepare_artifacts(&config)?;
    if let Some(seed) = config.agent.seed {
        info!(seed, "using deterministic seed");
    }

    let names: Vec<&str> = suite.iter().map(|s| s.name()).collect();
    println!("Running {} scenario(s) x {} round(s): {}", suite.len(), config.repeat, names.join(", "));

    let summary = drive(config, artifacts.clone(), &suite).await?;
    print_summary(&summary, &artifacts);
    Ok(exit_code(&summary))
}

/// Re-issue a persisted repro record once against a fresh target.
pub async fn run_replay(mut config: DroverConfig, file: &Path) -> Result<i32> {
    let replay = ReplayScenario::from_file(file)?;
    // The record already contains the seed command.
    config.agent.seed = None;
    config.repeat = 1;

    let artifacts = prepare_artifacts(&config)?;
    info!(
        file = %file.display(),
        commands = replay.record().sequence.len(),
        recorded_seed = ?replay.record().seed,
        "replaying repro record"
    );
    println!(
        "Replaying {} command(s) from {}",
        replay.record().sequence.len(),
        file.display()
    );

    let suite: Vec<Box<dyn Scenario>> = vec![Box::new(replay)];
    let summary = drive(config, artifacts.clone(), &suite).await?;
    print_summary(&summary, &artifacts);
    Ok(exit_code(&summary))
}

fn prepare_artifacts(config: &DroverConfig) -> Result<ArtifactStore> {
    let artifacts = ArtifactStore::create(&config.artifacts_dir)?;
    logging::init(Some(&artifacts.log_file()))?;
    if let Some(source) = &config.source {
        info!(path = %source.display(), "loaded config file");
    }
    info!(dir = %artifacts.root().display(), "artifacts directory ready");
    Ok(artifacts)
}

async fn drive(
    config: DroverConfig,
    artifacts: ArtifactStore,
    suite: &[Box<dyn Scenario>],
) -> Result<RunSummary> {
    // Teardown of an interrupted attempt reads state once, then stops the target.
    let teardown_grace = config.agent.action_timeout + config.agent.shutdown_grace;
    let agent = Agent::new(config.agent, artifacts).context("failed to build agent")?;
    let mut runner = ScenarioRunner::new(agent);
    let (cancel, finished) = interrupt_tokens(teardown_grace);
    let summary = runner.run_tests_until(suite, config.repeat, &cancel).await;
    finished.cancel();
    Ok(summary)
}

/// Wire Ctrl+C to the run. Returns the token that cancels the run and the
/// token the caller cancels once the target is torn down.
fn interrupt_tokens(teardown_grace: Duration) -> (CancellationToken, CancellationToken) {
    let cancel = CancellationToken::new();
    let finished = CancellationToken::new();
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let (cancel_clone, finished_clone) = (cancel.clone(), finished.clone());
    tokio::spawn(async move {
        if let Some(torn_down) = handle_interrupts(rx, cancel_clone, finished_clone, teardown_grace).await {
            if !torn_down {
                warn!(grace = ?teardown_grace, "teardown did not finish; the target may still be running");
            }
            eprintln!("Force exit.");
            std::process::exit(EXIT_INTERRUPTED);
        }
    });

    (cancel, finished)
}

/// The first interrupt cancels the run. The second waits up to `grace` for
/// `finished` and reports whether teardown completed. `None` means the
/// signal source closed before a second interrupt.
async fn handle_interrupts(
    mut signals: mpsc::Receiver<()>,
    cancel: CancellationToken,
    finished: CancellationToken,
    grace: Duration,
) -> Option<bool> {
    signals.recv().await?;
    eprintln!("\nStopping after the current attempt (Ctrl+C again to force)...");
    cancel.cancel();

    signals.recv().await?;
    eprintln!("\nWaiting up to {grace:?} for the target to stop...");
    Some(tokio::time::timeout(grace, finished.cancelled()).await.is_ok())
}

fn print_summary(summary: &RunSummary, artifacts: &ArtifactStore) {
    println!();
    for attempt in &summary.attempts {
        let status = match &attempt.outcome {
            AttemptOutcome::Succeeded => "PASS".to_string(),
            AttemptOutcome::Failed { kind, message } => format!("FAIL  {kind}: {message}"),
            AttemptOutcome::Interrupted => "INTERRUPTED".to_string(),
        };
        println!("  round {:>3}  {:<28} {status}", attempt.round, attempt.scenario);
    }
    println!();
    println!(
        "{} passed, {} failed{}",
        summary.passed(),
        summary.failed(),
        if summary.interrupted { ", interrupted" } else { "" }
    );
    if summary.failed() > 0 {
        println!("Crash log:  {}", artifacts.crash_file().display());
    }
    if artifacts.repro_file().exists() {
        println!("Repro file: {}", artifacts.repro_file().display());
    }
    println!("Log file:   {}", artifacts.log_file().display());
}

fn exit_code(summary: &RunSummary) -> i32 {
    if summary.interrupted {
        EXIT_INTERRUPTED
    } else if summary.failed() > 0 {
        EXIT_FAILED
    } else {
        0
    }
}
