use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use track_common::event::{EventType, TrackEvent};
use track_common::time::TimeSource;

/// Typed payload of every event kind the SDK knows how to collect.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PageView {
        url: String,
    },
    UniqueVisit {
        url: String,
    },
    Click {
        event: String,
        url: String,
    },
    Stay {
        url: String,
        /// Milliseconds spent on the page.
        stay_time: u64,
    },
    Route {
        from: String,
        to: String,
    },
    /// Application defined event. Properties are merged after `event`, so a
    /// property named `event` wins.
    Custom {
        event: String,
        properties: Map<String, Value>,
    },
    Performance {
        page_load_time: Option<f64>,
        fcp: Option<f64>,
        lcp: Option<f64>,
        ttfb: Option<f64>,
    },
    Error {
        message: String,
        filename: String,
        lineno: u32,
        colno: u32,
        stack: String,
    },
    UnhandledRejection {
        reason: String,
        stack: String,
    },
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::PageView { .. } => EventType::Pv,
            Payload::UniqueVisit { .. } => EventType::Uv,
            Payload::Click { .. } => EventType::Click,
            Payload::Stay { .. } => EventType::Stay,
            Payload::Route { .. } => EventType::Route,
            Payload::Custom { .. } => EventType::Custom,
            Payload::Performance { .. } => EventType::Performance,
            Payload::Error { .. } => EventType::Error,
            Payload::UnhandledRejection { .. } => EventType::UnhandledRejection,
        }
    }

    /// Flatten into the `data` object carried on the wire.
    pub fn into_data(self) -> Map<String, Value> {
        let value = match self {
            Payload::PageView { url } | Payload::UniqueVisit { url } => json!({ "url": url }),
            Payload::Click { event, url } => json!({ "event": event, "url": url }),
            Payload::Stay { url, stay_time } => json!({ "url": url, "stayTime": stay_time }),
            Payload::Route { from, to } => json!({ "from": from, "to": to }),
            Payload::Custom { event, properties } => {
                let mut data = Map::new();
                data.insert("event".to_owned(), Value::String(event));
                data.extend(properties);
                return data;
            }
            Payload::Performance {
                page_load_time,
                fcp,
                lcp,
                ttfb,
            } => json!({
                "pageLoadTime": page_load_time,
                "fcp": fcp,
                "lcp": lcp,
                "ttfb": ttfb,
            }),
            Payload::Error {
                message,
                filename,
                lineno,
                colno,
                stack,
            } => json!({
                "message": message,
                "filename": filename,
                "lineno": lineno,
                "colno": colno,
                "stack": stack,
            }),
            Payload::UnhandledRejection { reason, stack } => {
                json!({ "reason": reason, "stack": stack })
            }
        };

        match value {
            Value::Object(data) => data,
            _ => Map::new(),
        }
    }
}

/// An observation as handed to the encoder, before any validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObservation {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    pub data: Option<Map<String, Value>>,
}

impl RawObservation {
    pub fn from_payload(user_id: &str, payload: Payload) -> Self {
        Self {
            event_type: Some(payload.event_type().as_str().to_owned()),
            user_id: Some(user_id.to_owned()),
            timestamp: None,
            data: Some(payload.into_data()),
        }
    }
}

/// Normalizes raw observations into [`TrackEvent`]s. Pure: no network, no storage.
#[derive(Clone)]
pub struct Encoder {
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Encoder {
    pub fn new(timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self { timesource }
    }

    /// Returns `None` for observations without a known `type` or without a `userId`.
    pub fn encode(&self, raw: RawObservation) -> Option<TrackEvent> {
        let event_type = match raw.event_type.as_deref().map(str::parse::<EventType>) {
            Some(Ok(event_type)) => event_type,
            other => {
                tracing::debug!(?other, "dropping observation without a valid type");
                return None;
            }
        };

        let user_id = match raw.user_id {
            Some(user_id) if !user_id.is_empty() => user_id,
            _ => {
                tracing::debug!(%event_type, "dropping observation without a userId");
                return None;
            }
        };

        let timestamp = match raw.timestamp {
            Some(timestamp) if !timestamp.is_empty() => timestamp,
            _ => self.timesource.current_time(),
        };

        Some(TrackEvent {
            event_type,
            user_id,
            timestamp,
            data: raw.data.unwrap_or_default(),
        })
    }
}
