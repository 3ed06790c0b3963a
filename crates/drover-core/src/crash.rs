//! Crash capture for failed attempts.
//!
//! [`CrashHandler::handle`] never fails: each step that can go wrong
//! degrades to a note in the record or a log line.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Once;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::agent::Agent;
use crate::artifacts::ArtifactStore;
use crate::error::DriveError;

/// Kind recorded for errors a scenario raised itself.
pub const SCENARIO_FAILURE: &str = "ScenarioFailure";

/// Kind recorded when a scenario panicked.
pub const SCENARIO_PANIC: &str = "ScenarioPanic";

thread_local! {
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Remember where panics happen so [`Failure::from_panic`] can report it.
///
/// Installed once per process; the previous hook still runs. Clears any
/// location left on this thread by an earlier panic.
pub fn track_panic_locations() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let location = location.to_string();
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(location));
            }
            previous(info);
        }));
    });
    PANIC_LOCATION.with(|slot| slot.borrow_mut().take());
}

/// Why an attempt failed, flattened for the crash log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl Failure {
    /// Classify an error returned by a scenario or by the agent.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = DriveError::find_in(err)
            .map(DriveError::kind)
            .unwrap_or(SCENARIO_FAILURE);
        Self {
            kind: kind.to_string(),
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }
    }

    /// Build a failure from a caught panic payload.
    ///
    /// Call on the thread that caught the panic; the trace carries the panic
    /// location when [`track_panic_locations`] was called first.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "scenario panicked with a non-string payload".to_string()
        };
        let trace = match PANIC_LOCATION.with(|slot| slot.borrow_mut().take()) {
            Some(location) => format!("panicked at {location}: {message}"),
            None => format!("panicked: {message}"),
        };
        Self {
            kind: SCENARIO_PANIC.to_string(),
            trace,
            message,
        }
    }
}

/// What the handler managed to learn about the target's final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateCapture {
    LastKnownState { last_known_state: Value },
    CaptureFailed { capture_failure_reason: String },
}

/// One entry of the append-only crash log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    /// Scenario the failure happened in.
    pub context: String,
    pub error_kind: String,
    pub error_message: String,
    pub stack_trace: String,
    #[serde(flatten)]
    pub state: StateCapture,
}

/// Records diagnostics for failed attempts.
#[derive(Debug, Clone)]
pub struct CrashHandler {
    artifacts: ArtifactStore,
}

impl CrashHandler {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }

    /// Capture one failed attempt: read what state we can, append a crash
    /// record, and persist the attempt's repro record.
    pub async fn handle(&self, agent: &mut Agent, failure: &Failure, context: &str) -> CrashRecord {
        error!(
            scenario = context,
            kind = %failure.kind,
            "handling crash: {}",
            failure.message
        );

        let state = match agent.read_state().await {
            Ok(state) => StateCapture::LastKnownState {
                last_known_state: state.into_value(),
            },
            Err(e) => StateCapture::CaptureFailed {
                capture_failure_reason: format!("Failed to retrieve state: {e}"),
            },
        };

        let record = CrashRecord {
            timestamp: Utc::now(),
            context: context.to_string(),
            error_kind: failure.kind.clone(),
            error_message: failure.message.clone(),
            stack_trace: failure.trace.clone(),
            state,
        };

        match self.artifacts.append_crash(&record) {
            Ok(path) => error!(path = %path.display(), "crash report saved"),
            Err(e) => error!(error = %format!("{e:#}"), "failed to write crash report"),
        }

        if let Err(e) = agent.save_repro() {
            error!(error = %format!("{e:#}"), "failed to write repro record");
        }

        record
    }
}
