//! Transport bindings: how a [`Command`] reaches the target.
//!
//! ```text
//! Agent --send(cmd)--> dyn Transport
//!                        |-- PipeTransport: spawn target, JSON lines over stdin/stdout
//!                        `-- HttpTransport: one POST per command
//! ```
//!
//! A transport also owns the target's lifecycle: `start()` launches (or,
//! for network bindings, does nothing) and `stop()` tears down. Both
//! bindings enforce the configured per-call timeout themselves.

pub mod http;
pub mod pipe;

use async_trait::async_trait;

use crate::config::{AgentConfig, TransportKind};
use crate::error::DriveError;
use crate::protocol::{Command, Response};

pub use http::HttpTransport;
pub use pipe::PipeTransport;

/// A binding that can carry commands to a target.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Bring the target up, or confirm nothing needs doing.
    async fn start(&mut self) -> Result<(), DriveError>;

    /// Tear the target down. Must be a no-op when nothing is running.
    async fn stop(&mut self) -> Result<(), DriveError>;

    /// Send one command and wait for its response, bounded by the timeout.
    async fn send(&mut self, command: &Command) -> Result<Response, DriveError>;

    /// Whether a live target is attached.
    fn is_active(&self) -> bool;
}

// Compile-time assertion: Transport must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Transport) {}
};

/// Build the transport selected by `config`.
pub fn connect(config: &AgentConfig) -> Result<Box<dyn Transport>, DriveError> {
    config.validate()?;
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Pipe => Box::new(PipeTransport::new(config)),
        TransportKind::Http => Box::new(HttpTransport::new(config)?),
    };
    Ok(transport)
}
