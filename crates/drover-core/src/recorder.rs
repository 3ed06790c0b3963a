//! Command log and the repro record built from it.

use serde::{Deserialize, Serialize};

use crate::protocol::Command;

/// Ordered record of the mutating commands issued in one attempt.
///
/// Pure reads are skipped on entry; everything else is appended in issue
/// order, whether or not the target answered.
#[derive(Debug, Default, Clone)]
pub struct CommandLog {
    entries: Vec<Command>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous attempt.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Append `command` unless it is a pure read. Returns whether it was kept.
    pub fn record(&mut self, command: &Command) -> bool {
        if command.is_read_only() {
            return false;
        }
        self.entries.push(command.clone());
        true
    }

    pub fn commands(&self) -> &[Command] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the log together with the seed it was produced under.
    pub fn to_repro(&self, seed: Option<u64>) -> ReproRecord {
        ReproRecord {
            seed,
            sequence: self.entries.clone(),
        }
    }
}

/// Persisted replay data for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproRecord {
    pub seed: Option<u64>,
    pub sequence: Vec<Command>,
}
