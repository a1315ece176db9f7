use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use track_common::event::TrackEvent;
use track_common::time::{SystemTime, TimeSource};
use uuid::Uuid;

use crate::cache::{CacheStore, MemoryCache, UV_SLOT};
use crate::encoder::{Encoder, Payload, RawObservation};
use crate::error::MonitorError;
use crate::flush::{FlushController, FlushOutcome};
use crate::options::MonitorOptions;
use crate::queue::ClientQueue;
use crate::transport::{HttpTransport, Transport};

/// A unique visit is recorded at most once per window.
const UV_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Fed by the host whenever the current location may have changed.
pub trait RouteObserver {
    fn on_navigate(&self, url: &str);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceTiming {
    pub page_load_time: Option<f64>,
    pub fcp: Option<f64>,
    pub lcp: Option<f64>,
    pub ttfb: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub message: String,
    pub filename: String,
    pub lineno: u32,
    pub colno: u32,
    pub stack: String,
}

struct Session {
    url: String,
    stay_start: Instant,
}

pub struct MonitorBuilder {
    options: MonitorOptions,
    cache: Option<Arc<dyn CacheStore>>,
    transport: Option<Arc<dyn Transport + Send + Sync>>,
    timesource: Option<Arc<dyn TimeSource + Send + Sync>>,
}

impl MonitorBuilder {
    /// Durable storage for the pending queue and the unique-visit marker.
    /// Defaults to a [`MemoryCache`], which does not survive the process.
    pub fn cache(mut self, cache: impl CacheStore + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport + Send + Sync>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn time_source(mut self, timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.timesource = Some(timesource);
        self
    }

    /// Recover cached events, then record the initial page view and, if due, a
    /// unique visit for `url`.
    pub fn start(self, url: &str) -> Result<Monitor, MonitorError> {
        let options = self.options;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let transport: Arc<dyn Transport + Send + Sync> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(
                    &options.endpoint,
                    options.payload_format,
                    options.request_timeout,
                )
                .map_err(MonitorError::Setup)?,
            ),
        };
        let timesource = self
            .timesource
            .unwrap_or_else(|| Arc::new(SystemTime {}));
        let user_id = options
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let queue = ClientQueue::load(cache.clone());
        let monitor = Monitor {
            user_id,
            encoder: Encoder::new(timesource.clone()),
            timesource,
            flush: FlushController::new(queue, transport, options),
            cache,
            session: Mutex::new(Session {
                url: url.to_owned(),
                stay_start: Instant::now(),
            }),
        };

        tracing::debug!(user_id = %monitor.user_id, "monitor started");
        monitor.page_view(url);
        monitor.unique_visit(url);

        Ok(monitor)
    }
}

/// Client facade: turns host observations into events and hands them to its own
/// [`FlushController`]. Instances share no state with each other.
pub struct Monitor {
    user_id: String,
    encoder: Encoder,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    flush: FlushController,
    cache: Arc<dyn CacheStore>,
    session: Mutex<Session>,
}

impl Monitor {
    pub fn builder(options: impl Into<MonitorOptions>) -> MonitorBuilder {
        MonitorBuilder {
            options: options.into(),
            cache: None,
            transport: None,
            timesource: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn current_url(&self) -> String {
        self.session().url.clone()
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode and enqueue an untyped observation. Observations the encoder rejects
    /// are dropped.
    pub fn observe(&self, raw: RawObservation) -> Option<JoinHandle<FlushOutcome>> {
        let event = self.encoder.encode(raw)?;
        self.flush.enqueue(event)
    }

    /// Record a typed payload for this client. Returns the flush it triggered, if any.
    pub fn record(&self, payload: Payload) -> Option<JoinHandle<FlushOutcome>> {
        self.observe(RawObservation::from_payload(&self.user_id, payload))
    }

    fn encode(&self, payload: Payload) -> Option<TrackEvent> {
        self.encoder
            .encode(RawObservation::from_payload(&self.user_id, payload))
    }

    fn page_view(&self, url: &str) {
        self.record(Payload::PageView {
            url: url.to_owned(),
        });
    }

    fn unique_visit(&self, url: &str) {
        let Some(now) = self.timesource.current_millis() else {
            tracing::warn!("time source is not RFC 3339, skipping unique visit");
            return;
        };
        let last = match self.cache.load(UV_SLOT) {
            Ok(last) => last.and_then(|last| last.trim().parse::<u64>().ok()),
            Err(e) => {
                tracing::warn!("failed to read unique visit marker: {}", e);
                None
            }
        };

        let window = UV_WINDOW.as_millis() as u64;
        if last.is_some_and(|last| now.saturating_sub(last) <= window) {
            return;
        }

        if let Err(e) = self.cache.save(UV_SLOT, &now.to_string()) {
            tracing::warn!("failed to store unique visit marker: {}", e);
        }
        self.record(Payload::UniqueVisit {
            url: url.to_owned(),
        });
    }

    /// Application defined event. `properties` are merged into `data` after `event`.
    pub fn track(&self, event: &str, properties: Map<String, Value>) {
        self.record(Payload::Custom {
            event: event.to_owned(),
            properties,
        });
    }

    /// Click on an element carrying a tracking name. Untagged clicks record nothing.
    pub fn click(&self, event_name: Option<&str>, url: &str) {
        let Some(event) = event_name.filter(|name| !name.is_empty()) else {
            return;
        };
        self.record(Payload::Click {
            event: event.to_owned(),
            url: url.to_owned(),
        });
    }

    pub fn performance(&self, timing: PerformanceTiming) {
        self.record(Payload::Performance {
            page_load_time: timing.page_load_time,
            fcp: timing.fcp,
            lcp: timing.lcp,
            ttfb: timing.ttfb,
        });
    }

    pub fn error(&self, report: ErrorReport) {
        self.record(Payload::Error {
            message: report.message,
            filename: report.filename,
            lineno: report.lineno,
            colno: report.colno,
            stack: report.stack,
        });
    }

    pub fn unhandled_rejection(&self, reason: &str, stack: &str) {
        self.record(Payload::UnhandledRejection {
            reason: reason.to_owned(),
            stack: stack.to_owned(),
        });
    }

    pub fn on_error(&self, callback: impl Fn(&MonitorError) + Send + Sync + 'static) {
        self.flush.on_error(callback);
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.flush.flush().await
    }

    pub fn pending(&self) -> Vec<TrackEvent> {
        self.flush.pending()
    }

    /// Record the time spent on the current page and make a last delivery attempt.
    /// Undelivered events remain cached for the next session.
    pub async fn teardown(&self) -> FlushOutcome {
        let stay = {
            let session = self.session();
            Payload::Stay {
                url: session.url.clone(),
                stay_time: session.stay_start.elapsed().as_millis() as u64,
            }
        };
        if let Some(event) = self.encode(stay) {
            self.flush.enqueue_deferred(event);
        }

        self.flush.flush_final().await
    }
}

impl RouteObserver for Monitor {
    fn on_navigate(&self, url: &str) {
        let from = {
            let mut session = self.session();
            if session.url == url {
                return;
            }
            session.stay_start = Instant::now();
            std::mem::replace(&mut session.url, url.to_owned())
        };

        self.record(Payload::Route {
            from,
            to: url.to_owned(),
        });
        self.page_view(url);
    }
}
