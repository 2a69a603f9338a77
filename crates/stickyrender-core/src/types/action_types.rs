//! Action types: the unit of work executed inside the hosted application

use crate::error::{AdaptorError, ChannelError, DispatchError, Error, QueueError, ValidationError};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Queue-assigned action identifier
pub type ActionId = u64;

/// Action status state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Waiting in the queue
    Pending,
    /// Sent to the hosted application, no response yet
    InProgress,
    /// Completed successfully
    Done,
    /// Rejected, failed, timed out or cancelled
    Failed,
}

impl Default for ActionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Kind of a scalar argument value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Bool,
    Integer,
    Float,
    String,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::Bool => "bool",
            ArgKind::Integer => "integer",
            ArgKind::Float => "number",
            ArgKind::String => "string",
        };
        f.write_str(name)
    }
}

/// Scalar argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    pub fn kind(&self) -> ArgKind {
        match self {
            ArgValue::Bool(_) => ArgKind::Bool,
            ArgValue::Integer(_) => ArgKind::Integer,
            ArgValue::Float(_) => ArgKind::Float,
            ArgValue::String(_) => ArgKind::String,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Integer(i) => Some(*i),
            ArgValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Integer(i) => Some(*i as f64),
            ArgValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert a JSON value into a scalar, rejecting arrays, objects and null
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(ArgValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(ArgValue::Integer)
                .or_else(|| n.as_f64().map(ArgValue::Float)),
            serde_json::Value::String(s) => Some(ArgValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ArgValue::Bool(b) => serde_json::Value::Bool(*b),
            ArgValue::Integer(i) => serde_json::Value::from(*i),
            ArgValue::Float(f) => serde_json::Value::from(*f),
            ArgValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Integer(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::String(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::String(s)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Integer(i)
    }
}

impl From<i32> for ArgValue {
    fn from(i: i32) -> Self {
        ArgValue::Integer(i as i64)
    }
}

impl From<u32> for ArgValue {
    fn from(i: u32) -> Self {
        ArgValue::Integer(i as i64)
    }
}

impl From<f64> for ArgValue {
    fn from(f: f64) -> Self {
        ArgValue::Float(f)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

/// Ordered mapping of parameter name to scalar value.
///
/// Insertion order is kept on the wire; inserting an existing key replaces
/// the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArgs {
    entries: Vec<(String, ArgValue)>,
}

impl ActionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ArgValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ArgValue::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ArgValue::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ArgValue)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Parse an argument map from JSON. `null` is an empty map; anything other
    /// than an object of scalars is rejected.
    pub fn from_json(value: &serde_json::Value) -> std::result::Result<Self, ValidationError> {
        let map = match value {
            serde_json::Value::Null => return Ok(Self::new()),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(ValidationError::Malformed {
                    what: "action arguments".to_string(),
                    reason: format!("expected an object, got {}", other),
                })
            }
        };

        let mut args = Self::new();
        for (key, value) in map {
            let scalar = ArgValue::from_json(value).ok_or_else(|| ValidationError::InvalidValue {
                field: key.clone(),
                reason: "argument values must be strings, numbers or booleans".to_string(),
            })?;
            args.insert(key.clone(), scalar);
        }
        Ok(args)
    }
}

impl Serialize for ActionArgs {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActionArgs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        ActionArgs::from_json(&value).map_err(de::Error::custom)
    }
}

/// A queued, named request to be executed inside the hosted application
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    pub args: ActionArgs,
    pub status: ActionStatus,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl Action {
    pub fn new(name: impl Into<String>, args: ActionArgs) -> Self {
        Self {
            id: 0,
            name: name.into(),
            args,
            status: ActionStatus::Pending,
            enqueued_at: chrono::Utc::now(),
        }
    }
}

/// Why an action ended up FAILED
#[derive(Debug, Clone, PartialEq)]
pub enum ActionFailure {
    /// The stub rejected the command or the handler failed
    Dispatch(DispatchError),
    /// The channel failed while the action was in flight
    Channel(ChannelError),
    /// Removed from the queue before it started
    Cancelled,
    /// The queue was closed before the action started
    QueueClosed,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionFailure::Dispatch(e) => write!(f, "{}", e),
            ActionFailure::Channel(e) => write!(f, "{}", e),
            ActionFailure::Cancelled => f.write_str("cancelled before it started"),
            ActionFailure::QueueClosed => f.write_str("the adaptor shut down before it started"),
        }
    }
}

/// Final state of an action, delivered to whoever enqueued it
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub id: ActionId,
    pub name: String,
    pub status: ActionStatus,
    pub result: Option<serde_json::Value>,
    pub failure: Option<ActionFailure>,
}

impl ActionOutcome {
    pub fn done(action: &Action, result: serde_json::Value) -> Self {
        Self {
            id: action.id,
            name: action.name.clone(),
            status: ActionStatus::Done,
            result: Some(result),
            failure: None,
        }
    }

    pub fn failed(action: &Action, failure: ActionFailure) -> Self {
        Self {
            id: action.id,
            name: action.name.clone(),
            status: ActionStatus::Failed,
            result: None,
            failure: Some(failure),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ActionStatus::Done
    }

    /// Convert into the lifecycle-facing result. Dispatch failures keep the
    /// action name so the message is attributable.
    pub fn into_result(self) -> crate::Result<serde_json::Value> {
        if self.status == ActionStatus::Done {
            return Ok(self.result.unwrap_or(serde_json::Value::Null));
        }
        match self.failure {
            Some(ActionFailure::Channel(e)) => Err(Error::Channel(e)),
            Some(ActionFailure::QueueClosed) => Err(Error::Queue(QueueError::Closed(self.name))),
            Some(failure) => Err(Error::Adaptor(AdaptorError::ActionFailed {
                action: self.name,
                message: failure.to_string(),
            })),
            None => Err(Error::Adaptor(AdaptorError::ActionFailed {
                action: self.name,
                message: "no outcome recorded".to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_args_keep_insertion_order_on_the_wire() {
        let args = ActionArgs::new()
            .with("scene_file", "/proj/shot.mb")
            .with("frame", 42)
            .with("batch", true);

        let json = serde_json::to_string(&args).unwrap();
        assert_eq!(json, r#"{"scene_file":"/proj/shot.mb","frame":42,"batch":true}"#);
    }

    #[test]
    fn test_args_insert_replaces_in_place() {
        let mut args = ActionArgs::new().with("a", 1).with("b", 2);
        args.insert("a", 3);
        let keys: Vec<_> = args.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(args.get_i64("a"), Some(3));
    }

    #[test]
    fn test_args_reject_nested_values() {
        let value = serde_json::json!({ "camera": ["persp"] });
        let err = ActionArgs::from_json(&value).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == "camera"));
    }

    #[test]
    fn test_null_args_are_empty() {
        let args = ActionArgs::from_json(&serde_json::Value::Null).unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn test_arg_value_numeric_accessors() {
        assert_eq!(ArgValue::Float(12.0).as_i64(), Some(12));
        assert_eq!(ArgValue::Float(12.5).as_i64(), None);
        assert_eq!(ArgValue::Integer(7).as_f64(), Some(7.0));
        assert_eq!(ArgValue::from("x").kind(), ArgKind::String);
    }

    #[test]
    fn test_failed_outcome_names_the_action() {
        let action = Action::new("scene_file", ActionArgs::new());
        let outcome = ActionOutcome::failed(
            &action,
            ActionFailure::Dispatch(DispatchError::HandlerFailed {
                command: "scene_file".to_string(),
                message: "The scene file '/x.mb' does not exist".to_string(),
            }),
        );
        let err = outcome.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("scene_file"));
        assert!(msg.contains("does not exist"));
        assert!(!err.is_fatal());
    }
}
