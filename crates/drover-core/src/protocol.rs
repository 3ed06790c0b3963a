//! Wire types exchanged with the target.
//!
//! A [`Command`] is serialized as one JSON object `{"action": ..., "data": ...}`;
//! a [`Response`] is any JSON object the target chooses to send back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DriveError;

/// The pure-read action. Commands with this action never enter the command
/// log because replaying them changes nothing.
pub const READ_STATE_ACTION: &str = "get_state";

/// Action used for establishing target-side preconditions.
pub const SET_CONDITION_ACTION: &str = "set_condition";

/// Key under which a target reports its own failures in a response.
pub const ERROR_KEY: &str = "error";

/// One request to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand")]
pub struct Command {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
}

/// Unchecked wire shape; deserialized commands go through [`Command::new`].
#[derive(Deserialize)]
struct RawCommand {
    action: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

impl TryFrom<RawCommand> for Command {
    type Error = DriveError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let command = Command::new(raw.action)?;
        Ok(match raw.data {
            Some(data) => command.with_data(data),
            None => command,
        })
    }
}

impl Command {
    /// Build a command with no payload. Fails if `action` is empty.
    pub fn new(action: impl Into<String>) -> Result<Self, DriveError> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(DriveError::EmptyAction);
        }
        Ok(Self { action, data: None })
    }

    /// Attach a payload. An empty map is treated as no payload.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = if data.is_empty() { None } else { Some(data) };
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()
    }

    /// True for commands that only inspect state.
    pub fn is_read_only(&self) -> bool {
        self.action == READ_STATE_ACTION
    }

    /// Serialize as a single line without the trailing newline.
    pub fn to_line(&self) -> Result<String, DriveError> {
        serde_json::to_string(self).map_err(|e| DriveError::Protocol {
            reason: format!("failed to serialize command: {e}"),
            raw: self.action.clone(),
        })
    }
}

/// A target-defined JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(Map<String, Value>);

impl Response {
    /// Parse raw response text. Anything other than a JSON object is a
    /// protocol error carrying the offending text.
    pub fn parse(raw: &str) -> Result<Self, DriveError> {
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| DriveError::Protocol {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DriveError::Protocol {
                reason: format!("expected a JSON object, got {}", value_kind(&other)),
                raw: raw.to_string(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The target-reported failure, if the response carries one.
    ///
    /// The agent never acts on this; scenarios decide what it means.
    pub fn error(&self) -> Option<&Value> {
        self.0.get(ERROR_KEY)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Response {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Convert a `json!({...})` literal into a payload map.
///
/// Non-object values are wrapped as `{"value": v}` so callers never lose data.
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
