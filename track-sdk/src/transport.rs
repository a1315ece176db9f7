use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use track_common::event::TrackEvent;

use crate::error::TransportError;
use crate::options::PayloadFormat;

/// Delivers one batch to the collector. `Ok` means the collector acknowledged the
/// whole batch.
#[async_trait]
pub trait Transport {
    async fn send(&self, events: &[TrackEvent]) -> Result<(), TransportError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    events: &'a [TrackEvent],
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    format: PayloadFormat,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        format: PayloadFormat,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("track-sdk/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_owned(),
            format,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, events: &[TrackEvent]) -> Result<(), TransportError> {
        let request = self.client.post(&self.endpoint);
        let request = match self.format {
            PayloadFormat::Envelope => request.json(&Envelope { events }),
            PayloadFormat::BareArray => request.json(events),
        };

        let response = request.send().await?;
        let status = response.status();

        // The response body carries nothing the client acts on
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records delivered batches. Can fail a number of sends and hold each send for
    /// a delay to widen race windows.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        delivered: Mutex<Vec<Vec<TrackEvent>>>,
        failures: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub(crate) fn fail_next(&self, sends: usize) {
            self.failures.store(sends, Ordering::SeqCst);
        }

        pub(crate) fn delivered(&self) -> Vec<Vec<TrackEvent>> {
            self.delivered.lock().unwrap().clone()
        }

        pub(crate) fn max_concurrent(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, events: &[TrackEvent]) -> Result<(), TransportError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TransportError::Status(503));
            }

            self.delivered.lock().unwrap().push(events.to_vec());
            Ok(())
        }
    }
}
