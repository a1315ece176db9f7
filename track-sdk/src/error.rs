use thiserror::Error;

/// Failures of the local durable cache. Never fatal: the queue keeps working in memory.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache payload could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to collector failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("collector responded with status {0}")]
    Status(u16),
    #[error("transmission was interrupted before completing")]
    Interrupted,
}

/// Errors delivered to the host's error callback.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to deliver {events} events: {source}")]
    Delivery {
        events: usize,
        #[source]
        source: TransportError,
    },
    #[error("failed to persist pending events: {0}")]
    Cache(#[from] CacheError),
    #[error("failed to build transport: {0}")]
    Setup(TransportError),
}
