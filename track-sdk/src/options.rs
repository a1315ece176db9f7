use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Shape of the request body sent to the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// `{ "events": [...] }`
    #[default]
    Envelope,
    /// `[...]`
    BareArray,
}

/// SDK configuration. Keys are camelCase when deserialized (`batchSize`, `retryInterval`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorOptions {
    /// Collector URL events are POSTed to.
    pub endpoint: String,
    /// Buffer events until `batch_size` is reached instead of sending each one.
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed delay before retrying a failed transmission.
    #[serde(default = "default_retry_interval", deserialize_with = "millis")]
    pub retry_interval: Duration,
    /// Stable identifier for this client; a UUIDv7 is generated when absent.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    #[serde(default = "default_request_timeout", deserialize_with = "millis")]
    pub request_timeout: Duration,
}

fn default_batch_size() -> usize {
    10
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(3000)
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl MonitorOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            batch: false,
            batch_size: default_batch_size(),
            retry_interval: default_retry_interval(),
            user_id: None,
            payload_format: PayloadFormat::default(),
            request_timeout: default_request_timeout(),
        }
    }

    /// Enable batching with the given threshold.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch = true;
        self.batch_size = batch_size;
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn payload_format(mut self, payload_format: PayloadFormat) -> Self {
        self.payload_format = payload_format;
        self
    }

    /// Whether a queue holding `pending` events should be flushed now.
    pub fn should_flush(&self, pending: usize) -> bool {
        !self.batch || pending >= self.batch_size.max(1)
    }
}

impl From<&str> for MonitorOptions {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint)
    }
}
