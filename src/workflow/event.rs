//! Workflow Events
//!
//! Events are the immutable messages passed between steps. Each event has a
//! kind, which the scheduler uses for routing, and a payload of named JSON
//! fields.
//!
//! Three kinds are reserved:
//!
//! - `start`: the single event that opens a run, carrying its input parameters
//! - `stop`: terminates the run, carrying the final result under `result`
//! - `handoff`: transfers control to a named step (`target`, `reason`)
//!
//! Every other kind is a user-defined name such as `extraction_done`.

use std::fmt;

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::retry::ValidationError;

/// Named payload fields carried by an event.
pub type Payload = Map<String, Value>;

/// Payload field holding the final value of a `stop` event.
pub const RESULT_FIELD: &str = "result";

/// Payload field naming the destination of a `handoff` event.
pub const TARGET_FIELD: &str = "target";

/// Payload field holding the free-text reason of a `handoff` event.
pub const REASON_FIELD: &str = "reason";

/// Kind of the event emitted when a step's output fails validation.
pub const VALIDATION_ERROR: &str = "validation_error";

/// Discriminates events for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Opens a run. Exactly one per run.
    Start,
    /// Terminates a run with a result.
    Stop,
    /// Dynamic transfer of control to a step from an allow-list.
    Handoff,
    /// User-defined kind.
    Custom(String),
}

impl EventKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Handoff => "handoff",
            Self::Custom(name) => name,
        }
    }

    /// Returns true for the reserved kinds.
    pub fn is_reserved(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "handoff" => Self::Handoff,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "start" | "stop" | "handoff" => Self::from(name.as_str()),
            _ => Self::Custom(name),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(EventKind::from)
    }
}

/// An immutable, typed message between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    #[serde(default)]
    payload: Payload,
}

impl Event {
    /// Creates an event of the given kind with a payload.
    pub fn new(kind: impl Into<EventKind>, payload: Payload) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Creates an event of the given kind with an empty payload.
    pub fn custom(kind: impl Into<EventKind>) -> Self {
        Self::new(kind, Payload::new())
    }

    /// Creates the start event carrying caller-supplied parameters.
    pub fn start(params: Payload) -> Self {
        Self::new(EventKind::Start, params)
    }

    /// Creates a stop event carrying the run's final result.
    pub fn stop(result: impl Into<Value>) -> Self {
        Self::custom(EventKind::Stop).with(RESULT_FIELD, result)
    }

    /// Creates a handoff event naming the step that should run next.
    pub fn handoff(target: impl Into<String>, reason: impl Into<String>) -> Self {
        let target: String = target.into();
        let reason: String = reason.into();
        Self::custom(EventKind::Handoff)
            .with(TARGET_FIELD, target)
            .with(REASON_FIELD, reason)
    }

    /// Creates a `validation_error` event carrying the rejected output and
    /// the reason it was rejected.
    pub fn validation_error(prior_output: impl Into<Value>, error: &ValidationError) -> Self {
        Self::custom(VALIDATION_ERROR)
            .with("output", prior_output)
            .with("error", error.reason.clone())
    }

    /// Adds a payload field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind.as_str() == kind
    }

    /// Returns a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Returns a payload field if it is a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Decodes a payload field into `T`. Missing fields and type mismatches
    /// both yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.payload
            .get(field)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Returns the result carried by a stop event.
    pub fn result(&self) -> Option<&Value> {
        match self.kind {
            EventKind::Stop => self.payload.get(RESULT_FIELD),
            _ => None,
        }
    }

    /// Returns the destination of a handoff event.
    pub fn handoff_target(&self) -> Option<&str> {
        match self.kind {
            EventKind::Handoff => self.get_str(TARGET_FIELD),
            _ => None,
        }
    }

    /// Returns the reason given for a handoff.
    pub fn handoff_reason(&self) -> Option<&str> {
        match self.kind {
            EventKind::Handoff => self.get_str(REASON_FIELD),
            _ => None,
        }
    }
}
