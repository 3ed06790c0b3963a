//! Agent configuration.
//!
//! Built once, validated, and then owned read-only by the [`crate::Agent`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriveError;

/// How commands reach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Line-delimited JSON over the target process's stdin/stdout.
    Pipe,
    /// One JSON POST per command to a running endpoint.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe => f.write_str("pipe"),
            Self::Http => f.write_str("http"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = DriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" | "cli" => Ok(Self::Pipe),
            "http" => Ok(Self::Http),
            "socket" => Err(DriveError::Configuration(
                "socket transport is not implemented".to_string(),
            )),
            other => Err(DriveError::Configuration(format!(
                "unknown transport {other:?} (expected \"pipe\" or \"http\")"
            ))),
        }
    }
}

/// Settings fixed for the lifetime of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub transport: TransportKind,
    /// Target executable for the pipe binding.
    pub executable: Option<PathBuf>,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Endpoint for the HTTP binding.
    pub endpoint: String,
    /// Upper bound on a single command round trip.
    pub action_timeout: Duration,
    /// Step budget scenarios are expected to honor.
    pub max_steps_per_scenario: u32,
    /// Seed sent to the target after every start, if set.
    pub seed: Option<u64>,
    /// Pause after spawning the target before the first command.
    pub settle_delay: Duration,
    /// How long `stop()` waits for a graceful exit before killing.
    pub shutdown_grace: Duration,
}

impl AgentConfig {
    pub const DEFAULT_ENDPOINT: &'static str = "http://localhost:8080";
    pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_STEPS: u32 = 100;
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Configuration for driving a local executable over its pipes.
    pub fn pipe(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(executable.into()),
            ..Self::default()
        }
    }

    /// Configuration for driving an already-running HTTP endpoint.
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps_per_scenario = max_steps;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject settings no attempt could succeed with.
    ///
    /// A missing executable is not checked here: the pipe binding reports
    /// it from `start()` so the failure lands in the crash log.
    pub fn validate(&self) -> Result<(), DriveError> {
        if self.action_timeout.is_zero() {
            return Err(DriveError::Configuration(
                "action timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_steps_per_scenario == 0 {
            return Err(DriveError::Configuration(
                "max steps per scenario must be at least 1".to_string(),
            ));
        }
        if self.transport == TransportKind::Http {
            let endpoint = self.endpoint.trim();
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(DriveError::Configuration(format!(
                    "endpoint {endpoint:?} must be an http:// or https:// URL"
                )));
            }
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Pipe,
            executable: None,
            args: Vec::new(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            action_timeout: Self::DEFAULT_ACTION_TIMEOUT,
            max_steps_per_scenario: Self::DEFAULT_MAX_STEPS,
            seed: None,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
