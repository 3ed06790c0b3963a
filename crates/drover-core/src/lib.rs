//! Drives an application under test through a JSON command protocol,
//! repeats scenario suites against it, and captures crash diagnostics and
//! replayable command logs when something goes wrong.
//!
//! The pieces, bottom up:
//!
//! - [`protocol`]: the `Command` / `Response` wire objects.
//! - [`transport`]: how commands reach the target (a child process over
//!   stdin/stdout, or HTTP).
//! - [`agent`]: the facade scenarios talk to.
//! - [`runner`]: repeats scenarios with one isolated attempt each.
//! - [`crash`], [`recorder`], [`artifacts`]: what gets written when an
//!   attempt fails.
//! - [`replay`]: re-issues a persisted command sequence.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod crash;
pub mod error;
pub mod protocol;
pub mod recorder;
pub mod replay;
pub mod runner;
pub mod transport;

pub use agent::Agent;
pub use artifacts::ArtifactStore;
pub use config::{AgentConfig, TransportKind};
pub use crash::{CrashHandler, CrashRecord, Failure};
pub use error::DriveError;
pub use protocol::{Command, Response, payload};
pub use recorder::{CommandLog, ReproRecord};
pub use replay::ReplayScenario;
pub use runner::{
    AttemptOutcome, AttemptReport, RunSummary, Scenario, ScenarioRunner, scenario_fn,
};
