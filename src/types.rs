//! Relay-level core types
//!
//! A [`Pattern`] is the structured address used both to register a handler and
//! to invoke one. Keys ending in `$` are qualifiers that steer delivery; every
//! other key is part of the routing identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::relay::errors::RelayError;

/// Publish-only: no reply is expected
pub const PUBSUB: &str = "pubsub$";
/// Competing-consumer group override
pub const QUEUE: &str = "queue$";
/// Expected reply count (`-1` = unbounded)
pub const MAX_MESSAGES: &str = "maxMessages$";
/// Opaque object forwarded exactly one hop
pub const DELEGATE: &str = "delegate$";
/// Per-call reply timeout in milliseconds
pub const TIMEOUT: &str = "timeout$";

/// Key that names the service a pattern belongs to
pub const TOPIC: &str = "topic";

/// Whether a key is a qualifier rather than part of the routing identity
pub fn is_reserved(key: &str) -> bool {
    key.ends_with('$')
}

/// How many replies a caller is prepared to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxMessages {
    Bounded(u64),
    Unbounded,
}

impl MaxMessages {
    /// Whether `delivered` replies exhaust the allowance
    pub fn is_exhausted(&self, delivered: u64) -> bool {
        match self {
            MaxMessages::Bounded(n) => delivered >= *n,
            MaxMessages::Unbounded => false,
        }
    }
}

impl Default for MaxMessages {
    fn default() -> Self {
        MaxMessages::Bounded(1)
    }
}

/// Structured address: routing keys plus reserved qualifiers
///
/// Key order is irrelevant for matching; `serde_json`'s map keeps keys sorted,
/// which also gives [`Pattern::method`] its canonical ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(Map<String, Value>);

impl Pattern {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a pattern from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(RelayError::Validation(format!(
                "pattern must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Add or replace a key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// The routing topic, if present and a non-empty string
    pub fn topic(&self) -> Option<&str> {
        self.0
            .get(TOPIC)
            .and_then(Value::as_str)
            .filter(|topic| !topic.is_empty())
    }

    pub fn is_pubsub(&self) -> bool {
        self.0.get(PUBSUB).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn queue(&self) -> Option<&str> {
        self.0.get(QUEUE).and_then(Value::as_str)
    }

    /// Parse `maxMessages$`; absent means a single reply
    pub fn max_messages(&self) -> Result<MaxMessages, RelayError> {
        match self.0.get(MAX_MESSAGES) {
            None | Some(Value::Null) => Ok(MaxMessages::default()),
            Some(value) => match value.as_i64() {
                Some(-1) => Ok(MaxMessages::Unbounded),
                Some(n) if n >= 1 => Ok(MaxMessages::Bounded(n as u64)),
                _ => Err(RelayError::Validation(format!(
                    "{} must be -1 or a positive integer, got {}",
                    MAX_MESSAGES, value
                ))),
            },
        }
    }

    pub fn delegate(&self) -> Option<&Value> {
        self.0.get(DELEGATE).filter(|value| !value.is_null())
    }

    /// Parse `timeout$` in milliseconds
    pub fn timeout_ms(&self) -> Result<Option<u64>, RelayError> {
        match self.0.get(TIMEOUT) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                RelayError::Validation(format!(
                    "{} must be a non-negative integer, got {}",
                    TIMEOUT, value
                ))
            }),
        }
    }

    /// The pattern with every qualifier stripped
    pub fn routing(&self) -> Pattern {
        Pattern(
            self.0
                .iter()
                .filter(|(key, _)| !is_reserved(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    /// Number of routing keys, used to rank matches by specificity
    pub fn specificity(&self) -> usize {
        self.0.keys().filter(|key| !is_reserved(key)).count()
    }

    /// Whether this (registered) pattern accepts `request`
    ///
    /// Every routing key of `self` must appear in `request` with an equal value.
    pub fn matches(&self, request: &Pattern) -> bool {
        self.0
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .all(|(key, value)| request.0.get(key) == Some(value))
    }

    /// Deterministic `key:value` rendering of the scalar routing keys
    ///
    /// Keys are sorted and joined by commas, e.g. `a:1,b:2,cmd:add,topic:math`.
    /// Object and array values do not take part.
    pub fn method(&self) -> String {
        let mut keys: Vec<&String> = self.0.keys().filter(|key| !is_reserved(key)).collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let rendered = match &self.0[key.as_str()] {
                    Value::String(s) => s.clone(),
                    Value::Object(_) | Value::Array(_) => return None,
                    other => other.to_string(),
                };
                Some(format!("{}:{}", key, rendered))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.method())
    }
}

impl TryFrom<Value> for Pattern {
    type Error = RelayError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Pattern::from_value(value)
    }
}

impl From<Map<String, Value>> for Pattern {
    fn from(map: Map<String, Value>) -> Self {
        Pattern(map)
    }
}

/// Anything the relay API accepts where a pattern is expected
pub trait IntoPattern {
    fn into_pattern(self) -> Result<Pattern, RelayError>;
}

impl IntoPattern for Pattern {
    fn into_pattern(self) -> Result<Pattern, RelayError> {
        Ok(self)
    }
}

impl IntoPattern for Value {
    fn into_pattern(self) -> Result<Pattern, RelayError> {
        Pattern::from_value(self)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
