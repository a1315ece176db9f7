use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Categories of telemetry events a client can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Pv,
    Uv,
    Click,
    Stay,
    Route,
    Custom,
    Performance,
    Error,
    UnhandledRejection,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid EventType")]
pub struct ParseEventTypeError(pub String);

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Pv => "pv",
            EventType::Uv => "uv",
            EventType::Click => "click",
            EventType::Stay => "stay",
            EventType::Route => "route",
            EventType::Custom => "custom",
            EventType::Performance => "performance",
            EventType::Error => "error",
            EventType::UnhandledRejection => "unhandledrejection",
        }
    }
}

impl FromStr for EventType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pv" => Ok(EventType::Pv),
            "uv" => Ok(EventType::Uv),
            "click" => Ok(EventType::Click),
            "stay" => Ok(EventType::Stay),
            "route" => Ok(EventType::Route),
            "custom" => Ok(EventType::Custom),
            "performance" => Ok(EventType::Performance),
            "error" => Ok(EventType::Error),
            "unhandledrejection" => Ok(EventType::UnhandledRejection),
            invalid => Err(ParseEventTypeError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical event shape produced by the client encoder and sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// An event as read back from the intake queue.
///
/// Decoding never fails: the collection tier only guarantees the batch is a JSON
/// array, so malformed events must be rejected one by one instead of failing the
/// batch. Scalar `type`, `userId` and `timestamp` values are kept as their text,
/// anything else counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct EventData {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Text of a scalar as it reads when interpolated into a string.
fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl From<Value> for EventData {
    fn from(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };

        Self {
            event_type: fields.remove("type").and_then(scalar_text),
            user_id: fields.remove("userId").and_then(scalar_text),
            data: fields.remove("data").filter(|data| !data.is_null()),
            timestamp: fields.remove("timestamp").and_then(scalar_text),
        }
    }
}

impl EventData {
    /// True when both `type` and `userId` are present and non-empty.
    pub fn has_required_fields(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.event_type) && present(&self.user_id)
    }

    /// Deduplication key: `userId-timestamp-type`, with the timestamp compared as the
    /// literal string received. A missing timestamp contributes an empty segment.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.user_id.as_deref().unwrap_or_default(),
            self.timestamp.as_deref().unwrap_or_default(),
            self.event_type.as_deref().unwrap_or_default(),
        )
    }
}

impl From<TrackEvent> for EventData {
    fn from(event: TrackEvent) -> Self {
        Self {
            event_type: Some(event.event_type.as_str().to_owned()),
            user_id: Some(event.user_id),
            data: Some(Value::Object(event.data)),
            timestamp: Some(event.timestamp),
        }
    }
}

/// A validated, deduplicated event ready to be written to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    /// `data` serialized to its canonical JSON string.
    pub data: String,
}
