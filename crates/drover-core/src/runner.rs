//! Scenario runner: repeats a suite of scenarios with one isolated attempt
//! per (round, scenario) pair.
//!
//! Each attempt moves through the state graph
//!
//! ```text
//! not_started -> running     (target started)
//! not_started -> failed      (start itself failed)
//! running     -> succeeded
//! running     -> failed
//! running     -> interrupted (run cancelled)
//! succeeded   -> torn_down
//! failed      -> torn_down
//! interrupted -> torn_down
//! ```
//!
//! and always ends in `torn_down`: `stop()` runs on every exit path. A
//! failing attempt is handed to the [`CrashHandler`] exactly once and never
//! stops the suite. Only cancellation ends a run early.

use std::fmt;
use std::panic::AssertUnwindSafe;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::agent::Agent;
use crate::crash::{CrashHandler, Failure, track_panic_locations};

/// A verification routine run against a freshly started target.
///
/// Return `Err` (or panic) to fail the attempt.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, agent: &mut Agent) -> Result<()>;
}

// Compile-time assertion: Scenario must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Scenario) {}
};

/// Future returned by closure scenarios.
pub type ScenarioFuture<'a> = BoxFuture<'a, Result<()>>;

/// A [`Scenario`] backed by a closure. Build with [`scenario_fn`].
pub struct FnScenario<F> {
    name: String,
    body: F,
}

/// Wrap a closure as a scenario.
///
/// ```ignore
/// let scenario = scenario_fn("launch_and_read", |agent| {
///     Box::pin(async move {
///         let state = agent.read_state().await?;
///         anyhow::ensure!(state.get("status").is_some(), "state missing 'status'");
///         Ok(())
///     })
/// });
/// ```
pub fn scenario_fn<F>(name: impl Into<String>, body: F) -> FnScenario<F>
where
    F: for<'a> Fn(&'a mut Agent) -> ScenarioFuture<'a> + Send + Sync,
{
    FnScenario {
        name: name.into(),
        body,
    }
}

#[async_trait]
impl<F> Scenario for FnScenario<F>
where
    F: for<'a> Fn(&'a mut Agent) -> ScenarioFuture<'a> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, agent: &mut Agent) -> Result<()> {
        (self.body)(agent).await
    }
}

// ---------------------------------------------------------------------------
// Attempt state machine
// ---------------------------------------------------------------------------

/// Where one attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Interrupted,
    TornDown,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

impl AttemptState {
    /// Whether `self -> to` is an edge in the attempt graph.
    pub fn can_transition_to(self, to: AttemptState) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Running)
                | (Self::NotStarted, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Interrupted)
                | (Self::Succeeded, Self::TornDown)
                | (Self::Failed, Self::TornDown)
                | (Self::Interrupted, Self::TornDown)
        )
    }
}

struct Attempt {
    state: AttemptState,
}

impl Attempt {
    fn new() -> Self {
        Self {
            state: AttemptState::NotStarted,
        }
    }

    fn advance(&mut self, to: AttemptState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "invalid attempt transition: {} -> {}",
            self.state,
            to
        );
        debug!(from = %self.state, to = %to, "attempt transition");
        self.state = to;
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: String, message: String },
    Interrupted,
}

/// One attempt's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    /// 1-based repeat round.
    pub round: u32,
    pub scenario: String,
    pub outcome: AttemptOutcome,
    /// Mutating commands issued during the attempt.
    pub commands_logged: usize,
}

/// Results of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempts: Vec<AttemptReport>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, AttemptOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AttemptOutcome::Failed { .. }))
    }

    pub fn all_passed(&self) -> bool {
        !self.interrupted && self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&AttemptOutcome) -> bool) -> usize {
        self.attempts.iter().filter(|a| pred(&a.outcome)).count()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

enum BodyOutcome {
    Passed,
    Failed(Failure),
    Interrupted,
}

/// Runs scenario suites against one agent.
pub struct ScenarioRunner {
    agent: Agent,
    crash: CrashHandler,
}

impl ScenarioRunner {
    pub fn new(agent: Agent) -> Self {
        let crash = CrashHandler::new(agent.artifacts().clone());
        Self { agent, crash }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Run every scenario `repeat_count` times, in order.
    ///
    /// Never fails: every attempt's error is captured as a crash record.
    pub async fn run_tests(&mut self, scenarios: &[Box<dyn Scenario>], repeat_count: u32) -> RunSummary {
        self.run_tests_until(scenarios, repeat_count, &CancellationToken::new())
            .await
    }

    /// Like [`Self::run_tests`], stopping after the current attempt's
    /// teardown once `cancel` fires.
    pub async fn run_tests_until(
        &mut self,
        scenarios: &[Box<dyn Scenario>],
        repeat_count: u32,
        cancel: &CancellationToken,
    ) -> RunSummary {
        info!(
            scenarios = scenarios.len(),
            repeat_count, "starting test run"
        );
        if repeat_count == 0 || scenarios.is_empty() {
            warn!("nothing to run");
        }

        let mut summary = RunSummary::default();

        'rounds: for round in 1..=repeat_count {
            info!("--- starting iteration {round}/{repeat_count} ---");
            for (idx, scenario) in scenarios.iter().enumerate() {
                let name = scenario.name().to_string();
                info!("running scenario {}: {name}", idx + 1);

                let span = info_span!("attempt", round, scenario = %name);
                let report = self
                    .run_attempt(round, scenario.as_ref(), cancel)
                    .instrument(span)
                    .await;
                let interrupted = report.outcome == AttemptOutcome::Interrupted;
                summary.attempts.push(report);

                if interrupted {
                    summary.interrupted = true;
                    warn!("test run interrupted");
                    break 'rounds;
                }
            }
            info!("--- finished iteration {round}/{repeat_count} ---");
        }

        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            interrupted = summary.interrupted,
            "test run finished"
        );
        summary
    }

    async fn run_attempt(
        &mut self,
        round: u32,
        scenario: &dyn Scenario,
        cancel: &CancellationToken,
    ) -> AttemptReport {
        let name = scenario.name().to_string();
        let mut attempt = Attempt::new();

        let body_outcome = match self.agent.start().await {
            Err(e) => BodyOutcome::Failed(Failure::from_error(&e.into())),
            Ok(()) => {
                attempt.advance(AttemptState::Running);
                track_panic_locations();
                let agent = &mut self.agent;
                let body = async move {
                    agent.apply_seed().await?;
                    scenario.run(agent).await
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => BodyOutcome::Interrupted,
                    result = AssertUnwindSafe(body).catch_unwind() => match result {
                        Ok(Ok(())) => BodyOutcome::Passed,
                        Ok(Err(e)) => BodyOutcome::Failed(Failure::from_error(&e)),
                        Err(panic) => BodyOutcome::Failed(Failure::from_panic(panic)),
                    },
                }
            }
        };

        let outcome = match body_outcome {
            BodyOutcome::Passed => {
                attempt.advance(AttemptState::Succeeded);
                self.persist_repro();
                info!("scenario {name} completed successfully");
                AttemptOutcome::Succeeded
            }
            BodyOutcome::Failed(failure) => {
                attempt.advance(AttemptState::Failed);
                error!(kind = %failure.kind, "scenario {name} failed: {}", failure.message);
                self.crash.handle(&mut self.agent, &failure, &name).await;
                AttemptOutcome::Failed {
                    kind: failure.kind,
                    message: failure.message,
                }
            }
            BodyOutcome::Interrupted => {
                attempt.advance(AttemptState::Interrupted);
                warn!("scenario {name} interrupted");
                self.persist_repro();
                AttemptOutcome::Interrupted
            }
        };

        if let Err(e) = self.agent.stop().await {
            warn!(error = %e, "failed to stop target cleanly");
        }
        attempt.advance(AttemptState::TornDown);

        AttemptReport {
            round,
            scenario: name,
            outcome,
            commands_logged: self.agent.command_log().len(),
        }
    }

    fn persist_repro(&self) {
        if let Err(e) = self.agent.save_repro() {
            error!(error = %format!("{e:#}"), "failed to write repro record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::config::{AgentConfig, TransportKind};
    use crate::error::DriveError;
    use crate::protocol::{Command, Response, payload};
    use crate::transport::Transport;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lifecycle calls and answers every command with `{}`.
    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        sends: AtomicUsize,
    }

    struct MockTransport {
        counters: Arc<Counters>,
        active: bool,
        fail_start: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Pipe
        }

        async fn start(&mut self) -> Result<(), DriveError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(DriveError::Configuration("no executable".to_string()));
            }
            self.active = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), DriveError> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            self.active = false;
            Ok(())
        }

        async fn send(&mut self, _command: &Command) -> Result<Response, DriveError> {
            if !self.active {
                return Err(DriveError::NotRunning);
            }
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            Ok(Response::default())
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    struct Passing;

    #[async_trait]
    impl Scenario for Passing {
        fn name(&self) -> &str {
            "passing"
        }

        async fn run(&self, agent: &mut Agent) -> Result<()> {
            agent.send_user_action("tap", None).await?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Scenario for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _agent: &mut Agent) -> Result<()> {
            anyhow::bail!("verification failed")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Scenario for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(&self, _agent: &mut Agent) -> Result<()> {
            panic!("assertion failed: state.is_ready()");
        }
    }

    struct Hanging;

    #[async_trait]
    impl Scenario for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, _agent: &mut Agent) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn runner(fail_start: bool, seed: Option<u64>) -> (tempfile::TempDir, ScenarioRunner, Arc<Counters>) {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::create_with_stamp(tmp.path(), "runner").unwrap();
        let counters = Arc::new(Counters::default());
        let transport = MockTransport {
            counters: Arc::clone(&counters),
            active: false,
            fail_start,
        };
        let config = AgentConfig::default().with_seed(seed);
        let agent = Agent::with_transport(config, Box::new(transport), artifacts);
        (tmp, ScenarioRunner::new(agent), counters)
    }

    #[test]
    fn attempt_graph_edges() {
        use AttemptState::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(NotStarted.can_transition_to(Failed));
        assert!(Running.can_transition_to(Interrupted));
        assert!(Failed.can_transition_to(TornDown));
        assert!(!NotStarted.can_transition_to(Succeeded));
        assert!(!TornDown.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Failed));
    }

    #[tokio::test]
    async fn every_start_is_paired_with_a_stop() {
        let (_tmp, mut runner, counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Passing), Box::new(Failing), Box::new(Panicking)];

        let summary = runner.run_tests(&scenarios, 3).await;

        assert_eq!(summary.attempts.len(), 9);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 9);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 9);
        assert_eq!(summary.passed(), 3);
        assert_eq!(summary.failed(), 6);
        assert!(!summary.interrupted);
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_suite() {
        let (_tmp, mut runner, _counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Failing), Box::new(Passing)];

        let summary = runner.run_tests(&scenarios, 1).await;
        let names: Vec<&str> = summary.attempts.iter().map(|a| a.scenario.as_str()).collect();
        assert_eq!(names, vec!["failing", "passing"]);
        assert_eq!(summary.attempts[1].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn each_failure_leaves_one_crash_record() {
        let (_tmp, mut runner, _counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Failing), Box::new(Panicking), Box::new(Passing)];

        runner.run_tests(&scenarios, 2).await;

        let records = runner.agent().artifacts().read_crash_records().unwrap();
        let contexts: Vec<&str> = records.iter().map(|r| r.context.as_str()).collect();
        assert_eq!(contexts, vec!["failing", "panicking", "failing", "panicking"]);
        assert_eq!(records[0].error_kind, "ScenarioFailure");
        assert_eq!(records[1].error_kind, "ScenarioPanic");
        assert!(records[1].error_message.contains("state.is_ready()"));
        assert!(records[1].stack_trace.contains("runner.rs:"), "got: {}", records[1].stack_trace);
    }

    #[tokio::test]
    async fn start_failure_is_a_failed_attempt() {
        let (_tmp, mut runner, counters) = runner(true, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Passing)];

        let summary = runner.run_tests(&scenarios, 2).await;

        assert_eq!(summary.failed(), 2);
        match &summary.attempts[0].outcome {
            AttemptOutcome::Failed { kind, .. } => assert_eq!(kind, "ConfigurationError"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn seed_precedes_the_scenario_body() {
        let (_tmp, mut runner, _counters) = runner(false, Some(7));
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Passing)];

        let summary = runner.run_tests(&scenarios, 1).await;
        assert_eq!(summary.attempts[0].commands_logged, 2);

        let record = runner.agent().artifacts().read_repro_record().unwrap().unwrap();
        assert_eq!(record.seed, Some(7));
        assert_eq!(record.sequence[0].action(), "set_condition");
        assert_eq!(
            record.sequence[0].data(),
            Some(&payload(json!({"rng_seed": 7})))
        );
        assert_eq!(record.sequence[1].action(), "tap");
    }

    #[tokio::test]
    async fn cancellation_tears_down_and_stops_the_run() {
        let (_tmp, mut runner, counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Hanging), Box::new(Passing)];
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = runner.run_tests_until(&scenarios, 5, &cancel).await;

        assert!(summary.interrupted);
        assert_eq!(summary.attempts.len(), 1);
        assert_eq!(summary.attempts[0].outcome, AttemptOutcome::Interrupted);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(runner.agent().artifacts().read_crash_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closure_scenarios_run() {
        let (_tmp, mut runner, _counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(scenario_fn("closure", |agent| {
            Box::pin(async move {
                agent.read_state().await?;
                agent.send_user_action("tap", None).await?;
                Ok::<(), anyhow::Error>(())
            })
        }))];

        let summary = runner.run_tests(&scenarios, 1).await;
        assert!(summary.all_passed());
        assert_eq!(summary.attempts[0].scenario, "closure");
        assert_eq!(summary.attempts[0].commands_logged, 1);
    }

    #[tokio::test]
    async fn zero_rounds_runs_nothing() {
        let (_tmp, mut runner, counters) = runner(false, None);
        let scenarios: Vec<Box<dyn Scenario>> = vec![Box::new(Passing)];
        let summary = runner.run_tests(&scenarios, 0).await;
        assert!(summary.attempts.is_empty());
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
    }
}
