//! The agent facade scenarios talk to.
//!
//! An [`Agent`] owns the transport (and with it the target process), the
//! command log for the current attempt, and the artifact store. Every
//! command goes through [`Agent::send_command`], which records mutating
//! commands before they are sent so a command that kills the target still
//! shows up in the repro record.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::config::AgentConfig;
use crate::error::DriveError;
use crate::protocol::{Command, READ_STATE_ACTION, Response, SET_CONDITION_ACTION};
use crate::recorder::{CommandLog, ReproRecord};
use crate::transport::{self, Transport};

/// Drives one target through a sequence of commands.
pub struct Agent {
    config: AgentConfig,
    transport: Box<dyn Transport>,
    log: CommandLog,
    artifacts: ArtifactStore,
    steps_taken: u32,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("transport", &self.transport.kind())
            .field("active", &self.transport.is_active())
            .field("logged_commands", &self.log.len())
            .field("steps_taken", &self.steps_taken)
            .finish()
    }
}

impl Agent {
    /// Build an agent with the transport `config` selects.
    pub fn new(config: AgentConfig, artifacts: ArtifactStore) -> Result<Self, DriveError> {
        let transport = transport::connect(&config)?;
        Ok(Self::with_transport(config, transport, artifacts))
    }

    /// Build an agent around an existing transport.
    pub fn with_transport(
        config: AgentConfig,
        transport: Box<dyn Transport>,
        artifacts: ArtifactStore,
    ) -> Self {
        info!(transport = %config.transport, "agent initialized");
        Self {
            config,
            transport,
            log: CommandLog::new(),
            artifacts,
            steps_taken: 0,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn max_steps(&self) -> u32 {
        self.config.max_steps_per_scenario
    }

    /// User actions sent since the last `start()`.
    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    /// Mutating commands issued since the last `start()`.
    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_active()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin a new attempt: clear the command log and bring the target up.
    pub async fn start(&mut self) -> Result<(), DriveError> {
        self.log.reset();
        self.steps_taken = 0;
        self.transport.start().await
    }

    /// Tear the target down. Safe to call at any time, any number of times.
    pub async fn stop(&mut self) -> Result<(), DriveError> {
        info!("stopping the app");
        self.transport.stop().await
    }

    // -----------------------------------------------------------------------
    // Facade operations
    // -----------------------------------------------------------------------

    /// Read the target's full current state. Never logged.
    pub async fn read_state(&mut self) -> Result<Response, DriveError> {
        info!("requesting all information from app");
        self.send_command(Command::new(READ_STATE_ACTION)?).await
    }

    /// Establish target-side preconditions (mock data, injected state).
    pub async fn set_condition(&mut self, data: Map<String, Value>) -> Result<Response, DriveError> {
        let condition = Value::Object(data.clone());
        info!(condition = %condition, "setting condition");
        let command = Command::new(SET_CONDITION_ACTION)?.with_data(data);
        self.send_command(command).await
    }

    /// Simulate one discrete user interaction.
    pub async fn send_user_action(
        &mut self,
        kind: &str,
        data: Option<Map<String, Value>>,
    ) -> Result<Response, DriveError> {
        let mut command = Command::new(kind)?;
        if let Some(data) = data {
            command = command.with_data(data);
        }
        info!(action = kind, data = ?command.data(), "sending user action");
        self.steps_taken = self.steps_taken.saturating_add(1);
        self.send_command(command).await
    }

    /// Persist a named state snapshot. Reads the state first when `data`
    /// is `None`.
    pub async fn save_snapshot(&mut self, tag: &str, data: Option<Value>) -> Result<PathBuf> {
        let state = match data {
            Some(state) => state,
            None => self.read_state().await?.into_value(),
        };
        let path = self
            .artifacts
            .write_snapshot(tag, state)
            .with_context(|| format!("failed to save snapshot {tag:?}"))?;
        info!(path = %path.display(), "snapshot saved");
        Ok(path)
    }

    /// Fail once the scenario has used its step budget.
    ///
    /// Scenarios that loop call this before each step; the agent itself
    /// never cuts a scenario short.
    pub fn ensure_step_budget(&self) -> Result<(), DriveError> {
        if self.steps_taken >= self.config.max_steps_per_scenario {
            return Err(DriveError::StepBudgetExhausted {
                max: self.config.max_steps_per_scenario,
            });
        }
        Ok(())
    }

    /// Record (if mutating) and send one command.
    pub async fn send_command(&mut self, command: Command) -> Result<Response, DriveError> {
        if self.log.record(&command) {
            debug!(action = command.action(), logged = self.log.len(), "command recorded");
        }
        self.transport.send(&command).await
    }

    // -----------------------------------------------------------------------
    // Runner hooks
    // -----------------------------------------------------------------------

    /// Send the configured seed, if any, so the target starts deterministic.
    pub(crate) async fn apply_seed(&mut self) -> Result<(), DriveError> {
        if let Some(seed) = self.config.seed {
            debug!(seed, "applying deterministic seed");
            self.set_condition(crate::protocol::payload(json!({ "rng_seed": seed })))
                .await?;
        }
        Ok(())
    }

    /// Overwrite the run's repro file with this attempt's log.
    ///
    /// Nothing is written when the attempt issued no mutating command.
    pub fn save_repro(&self) -> Result<Option<PathBuf>> {
        if self.log.is_empty() {
            return Ok(None);
        }
        let record: ReproRecord = self.log.to_repro(self.config.seed);
        let path = self.artifacts.write_repro(&record)?;
        debug!(path = %path.display(), commands = record.sequence.len(), "repro record saved");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload;
    use drover_test_utils::{TargetScript, write_target_script};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        agent: Agent,
    }

    fn fixture(seed: Option<u64>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_target_script(tmp.path(), TargetScript::Counter);
        let config = AgentConfig::pipe(&script)
            .with_settle_delay(Duration::ZERO)
            .with_action_timeout(Duration::from_secs(2))
            .with_max_steps(3)
            .with_seed(seed);
        let artifacts = ArtifactStore::create_with_stamp(tmp.path().join("artifacts"), "test").unwrap();
        let agent = Agent::new(config, artifacts).unwrap();
        Fixture { _tmp: tmp, agent }
    }

    #[tokio::test]
    async fn reads_do_not_grow_the_log() {
        let mut fx = fixture(None);
        assert!(!fx.agent.is_running());
        fx.agent.start().await.unwrap();
        assert!(fx.agent.is_running());
        fx.agent.read_state().await.unwrap();
        fx.agent.read_state().await.unwrap();
        assert!(fx.agent.command_log().is_empty());
        fx.agent.stop().await.unwrap();
        assert!(!fx.agent.is_running());
    }

    #[tokio::test]
    async fn mutations_are_logged_in_order() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        fx.agent
            .set_condition(payload(json!({"mock_scenario": "game_over"})))
            .await
            .unwrap();
        let resp = fx.agent.send_user_action("click_restart_button", None).await.unwrap();
        assert_eq!(resp.get("count"), Some(&json!(2)));

        let actions: Vec<&str> = fx
            .agent
            .command_log()
            .commands()
            .iter()
            .map(Command::action)
            .collect();
        assert_eq!(actions, vec!["set_condition", "click_restart_button"]);
        assert_eq!(fx.agent.steps_taken(), 1);
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_resets_log_and_steps() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        fx.agent.send_user_action("tap", None).await.unwrap();
        fx.agent.stop().await.unwrap();

        fx.agent.start().await.unwrap();
        assert!(fx.agent.command_log().is_empty());
        assert_eq!(fx.agent.steps_taken(), 0);
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_command_is_still_logged() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        let err = fx.agent.send_user_action("crash", None).await.unwrap_err();
        assert_eq!(err.kind(), "TargetUnresponsive");
        assert_eq!(fx.agent.command_log().len(), 1);
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn target_reported_errors_are_returned_untouched() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        let resp = fx.agent.send_user_action("reject", None).await.unwrap();
        assert_eq!(resp.error(), Some(&json!("rejected by target")));
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn step_budget_trips_at_max() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        for _ in 0..3 {
            fx.agent.ensure_step_budget().unwrap();
            fx.agent.send_user_action("tap", None).await.unwrap();
        }
        let err = fx.agent.ensure_step_budget().unwrap_err();
        assert!(matches!(err, DriveError::StepBudgetExhausted { max: 3 }));
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn seed_is_sent_as_condition() {
        let mut fx = fixture(Some(42));
        fx.agent.start().await.unwrap();
        fx.agent.apply_seed().await.unwrap();
        let logged = &fx.agent.command_log().commands()[0];
        assert_eq!(logged.action(), "set_condition");
        assert_eq!(logged.data().and_then(|d| d.get("rng_seed")), Some(&json!(42)));

        let path = fx.agent.save_repro().unwrap().expect("repro written");
        let record = crate::artifacts::load_repro_record(&path).unwrap();
        assert_eq!(record.seed, Some(42));
        assert_eq!(record.sequence.len(), 1);
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn empty_log_writes_no_repro() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        fx.agent.read_state().await.unwrap();
        assert!(fx.agent.save_repro().unwrap().is_none());
        assert!(!fx.agent.artifacts().repro_file().exists());
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_without_data_reads_state() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        let path = fx.agent.save_snapshot("pre_action", None).await.unwrap();
        let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["state"]["status"], json!("ok"));
        assert!(fx.agent.command_log().is_empty());
        fx.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_with_data_skips_the_target() {
        let mut fx = fixture(None);
        // Not started: a state read would fail with NotRunning.
        let path = fx
            .agent
            .save_snapshot("offline", Some(json!({"note": "given"})))
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn empty_user_action_is_rejected_before_sending() {
        let mut fx = fixture(None);
        fx.agent.start().await.unwrap();
        let err = fx.agent.send_user_action("", None).await.unwrap_err();
        assert!(matches!(err, DriveError::EmptyAction));
        assert!(fx.agent.command_log().is_empty());
        fx.agent.stop().await.unwrap();
    }
}
