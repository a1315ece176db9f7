//! Single-flight delivery of the client queue.
//!
//! At most one batch is on the wire per controller. Triggers that fire while a
//! batch is in flight are no-ops; the events they would have sent stay queued and
//! go out with the next flush.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use track_common::event::TrackEvent;

use crate::error::{CacheError, MonitorError};
use crate::options::MonitorOptions;
use crate::queue::ClientQueue;
use crate::transport::Transport;

pub type ErrorCallback = Arc<dyn Fn(&MonitorError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A batch of this many events was acknowledged by the collector.
    Sent(usize),
    /// Nothing to send, or another batch was already in flight.
    Skipped,
    /// The batch went back to the front of the queue.
    Failed,
}

impl FlushOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            FlushOutcome::Sent(_) => "sent",
            FlushOutcome::Skipped => "skipped",
            FlushOutcome::Failed => "failed",
        }
    }
}

struct Inner {
    queue: Mutex<ClientQueue>,
    transport: Arc<dyn Transport + Send + Sync>,
    options: MonitorOptions,
    on_error: RwLock<Option<ErrorCallback>>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, ClientQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, error: MonitorError) {
        tracing::warn!("{}", error);

        let callback = self
            .on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&error);
        }
    }

    fn report_cache(&self, result: Result<(), CacheError>) {
        if let Err(e) = result {
            self.report(MonitorError::Cache(e));
        }
    }

    fn cancel_retry(&self) {
        let pending = self
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = pending {
            handle.abort();
        }
    }
}

/// A drained batch. Until `complete` or `fail` runs, dropping the guard puts the
/// batch back at the front of the queue.
struct InFlight {
    inner: Arc<Inner>,
    batch: Option<Vec<TrackEvent>>,
}

impl InFlight {
    fn begin(inner: &Arc<Inner>, queue: &mut ClientQueue) -> Option<Self> {
        queue.begin_flight().map(|batch| Self {
            inner: inner.clone(),
            batch: Some(batch),
        })
    }

    fn events(&self) -> &[TrackEvent] {
        self.batch.as_deref().unwrap_or_default()
    }

    fn complete(mut self) -> Result<(), CacheError> {
        self.batch.take();
        self.inner.queue().complete_flight()
    }

    fn fail(mut self) -> Result<(), CacheError> {
        let batch = self.batch.take().unwrap_or_default();
        self.inner.queue().abort_flight(batch)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            tracing::debug!(events = batch.len(), "flush interrupted, restoring batch");
            if let Err(e) = self.inner.queue().abort_flight(batch) {
                tracing::warn!("failed to persist restored batch: {}", e);
            }
        }
    }
}

async fn transmit(inner: Arc<Inner>, flight: InFlight, retry: bool) -> FlushOutcome {
    let events = flight.events().len();
    let sent = inner.transport.send(flight.events()).await;

    let outcome = match sent {
        Ok(()) => {
            inner.report_cache(flight.complete());
            tracing::debug!(events, "flushed events");
            FlushOutcome::Sent(events)
        }
        Err(source) => {
            inner.report_cache(flight.fail());
            inner.report(MonitorError::Delivery { events, source });
            if retry {
                schedule_retry(&inner);
            }
            FlushOutcome::Failed
        }
    };

    metrics::counter!("sdk_flush_total", "outcome" => outcome.as_label()).increment(1);
    outcome
}

fn schedule_retry(inner: &Arc<Inner>) {
    let Ok(runtime) = Handle::try_current() else {
        return;
    };

    let weak: Weak<Inner> = Arc::downgrade(inner);
    let delay = inner.options.retry_interval;

    let handle = runtime.spawn(async move {
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        // Detach from the retry slot so a failure below can schedule the next one
        inner
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let flight = {
            let mut queue = inner.queue();
            InFlight::begin(&inner, &mut queue)
        };
        if let Some(flight) = flight {
            transmit(inner.clone(), flight, true).await;
        }
    });

    let previous = inner
        .retry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(handle);
    if let Some(previous) = previous {
        previous.abort();
    }
}

/// Owns the client queue and decides when its contents go on the wire.
///
/// Cloning yields another handle to the same queue and in-flight state.
#[derive(Clone)]
pub struct FlushController {
    inner: Arc<Inner>,
}

impl FlushController {
    pub fn new(
        queue: ClientQueue,
        transport: Arc<dyn Transport + Send + Sync>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(queue),
                transport,
                options,
                on_error: RwLock::new(None),
                retry: Mutex::new(None),
            }),
        }
    }

    /// Register the callback receiving delivery and persistence failures.
    pub fn on_error(&self, callback: impl Fn(&MonitorError) + Send + Sync + 'static) {
        *self
            .inner
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Queue an event and start a flush if the trigger policy calls for one.
    ///
    /// Returns the spawned flush when one started. Outside a tokio runtime nothing
    /// is spawned and the event waits for the next flush.
    pub fn enqueue(&self, event: TrackEvent) -> Option<JoinHandle<FlushOutcome>> {
        let runtime = Handle::try_current().ok();

        let (persisted, flight) = {
            let mut queue = self.inner.queue();
            let persisted = queue.enqueue(event);
            let flight = match runtime {
                Some(_) if self.inner.options.should_flush(queue.len()) => {
                    InFlight::begin(&self.inner, &mut queue)
                }
                _ => None,
            };
            (persisted, flight)
        };
        self.inner.report_cache(persisted);

        let (runtime, flight) = (runtime?, flight?);
        Some(runtime.spawn(transmit(self.inner.clone(), flight, true)))
    }

    /// Queue an event without triggering a flush.
    pub fn enqueue_deferred(&self, event: TrackEvent) {
        let persisted = self.inner.queue().enqueue(event);
        self.inner.report_cache(persisted);
    }

    /// Send everything pending now. A failure schedules a retry.
    pub async fn flush(&self) -> FlushOutcome {
        self.flush_with(true).await
    }

    /// Best-effort last flush: no retry is scheduled and any pending retry is
    /// cancelled. Events that fail stay in the cache for the next session.
    pub async fn flush_final(&self) -> FlushOutcome {
        self.inner.cancel_retry();
        self.flush_with(false).await
    }

    async fn flush_with(&self, retry: bool) -> FlushOutcome {
        let flight = {
            let mut queue = self.inner.queue();
            InFlight::begin(&self.inner, &mut queue)
        };

        match flight {
            Some(flight) => transmit(self.inner.clone(), flight, retry).await,
            None => FlushOutcome::Skipped,
        }
    }

    pub fn pending(&self) -> Vec<TrackEvent> {
        self.inner.queue().pending()
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.queue().is_in_flight()
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.inner.options
    }
}
