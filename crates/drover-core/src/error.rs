//! Error taxonomy for driving a target.
//!
//! Every failure the agent itself can raise is a [`DriveError`]. Scenario
//! bodies return `anyhow::Result`, so a `DriveError` usually reaches the
//! runner wrapped in an `anyhow::Error`; [`DriveError::find_in`] digs it
//! back out for classification.

use std::time::Duration;

/// Errors raised by the transport, the process lifecycle, and the facade.
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    /// Missing or invalid setup. Fatal to the attempt.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The target produced no response within the timeout, or closed its
    /// output channel.
    #[error("target unresponsive to {action:?} after {timeout:?}: {reason}{}", stderr_suffix(.stderr))]
    TargetUnresponsive {
        action: String,
        timeout: Duration,
        reason: String,
        /// Whatever the target wrote to its error stream, if anything.
        stderr: String,
    },

    /// The target answered with something that is not a JSON object.
    #[error("malformed response from target ({reason}): {raw:?}")]
    Protocol { reason: String, raw: String },

    /// Network-level failure on the HTTP binding.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// A command was issued while no target process was running.
    #[error("target is not running")]
    NotRunning,

    /// A command was built with an empty action name.
    #[error("command action must not be empty")]
    EmptyAction,

    /// A scenario asked for another step after exhausting its budget.
    #[error("step budget exhausted: reached max steps ({max})")]
    StepBudgetExhausted { max: u32 },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" (stderr: {})", stderr.trim())
    }
}

impl DriveError {
    /// Stable name recorded as the crash record's `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::TargetUnresponsive { .. } => "TargetUnresponsive",
            Self::Protocol { .. } => "ProtocolError",
            Self::Transport { .. } => "TransportError",
            Self::NotRunning => "NotRunning",
            Self::EmptyAction => "EmptyAction",
            Self::StepBudgetExhausted { .. } => "StepBudgetExhausted",
        }
    }

    /// Find the first `DriveError` anywhere in an error chain.
    pub fn find_in(err: &anyhow::Error) -> Option<&DriveError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DriveError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn unresponsive_message_includes_stderr_when_present() {
        let err = DriveError::TargetUnresponsive {
            action: "tap".to_string(),
            timeout: Duration::from_secs(2),
            reason: "channel closed".to_string(),
            stderr: "segfault\n".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"tap\""), "got: {msg}");
        assert!(msg.contains("stderr: segfault"), "got: {msg}");
    }

    #[test]
    fn unresponsive_message_omits_empty_stderr() {
        let err = DriveError::TargetUnresponsive {
            action: "tap".to_string(),
            timeout: Duration::from_secs(2),
            reason: "timed out".to_string(),
            stderr: "  ".to_string(),
        };
        assert!(!err.to_string().contains("stderr"));
    }

    #[test]
    fn protocol_error_keeps_raw_text() {
        let err = DriveError::Protocol {
            reason: "expected value".to_string(),
            raw: "<html>".to_string(),
        };
        assert!(err.to_string().contains("<html>"));
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[test]
    fn find_in_sees_through_context() {
        let err = anyhow::Error::from(DriveError::NotRunning).context("reading state");
        let err = Err::<(), _>(err).context("scenario step 2").unwrap_err();
        let found = DriveError::find_in(&err).expect("drive error in chain");
        assert_eq!(found.kind(), "NotRunning");
    }

    #[test]
    fn find_in_returns_none_for_plain_errors() {
        let err = anyhow::anyhow!("assertion failed");
        assert!(DriveError::find_in(&err).is_none());
    }
}
