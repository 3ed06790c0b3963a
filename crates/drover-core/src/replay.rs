//! Replaying a persisted repro record.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::artifacts::load_repro_record;
use crate::protocol::Response;
use crate::recorder::ReproRecord;
use crate::runner::Scenario;

/// Tag of the snapshot taken after the last replayed command.
pub const REPLAY_SNAPSHOT_TAG: &str = "replay_final";

/// Re-issues a recorded command sequence verbatim.
///
/// The record's seed command, if any, is part of the sequence; run the
/// agent without a seed so it is not sent twice.
pub struct ReplayScenario {
    record: ReproRecord,
    responses: Mutex<Vec<Response>>,
}

impl ReplayScenario {
    pub fn from_record(record: ReproRecord) -> Self {
        Self {
            record,
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let record = load_repro_record(path)?;
        Ok(Self::from_record(record))
    }

    pub fn record(&self) -> &ReproRecord {
        &self.record
    }

    /// Responses collected by the most recent run, in command order.
    pub fn responses(&self) -> Vec<Response> {
        self.responses
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Scenario for ReplayScenario {
    fn name(&self) -> &str {
        "replay"
    }

    async fn run(&self, agent: &mut Agent) -> Result<()> {
        let total = self.record.sequence.len();
        info!(commands = total, seed = ?self.record.seed, "replaying recorded sequence");

        let mut collected = Vec::with_capacity(total);
        for (idx, command) in self.record.sequence.iter().enumerate() {
            debug!(step = idx + 1, action = command.action(), "replaying command");
            let response = agent
                .send_command(command.clone())
                .await
                .with_context(|| format!("replay step {} ({})", idx + 1, command.action()))?;
            collected.push(response);
        }

        if let Ok(mut responses) = self.responses.lock() {
            *responses = collected;
        }

        agent.save_snapshot(REPLAY_SNAPSHOT_TAG, None).await?;
        Ok(())
    }
}
