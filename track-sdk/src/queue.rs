use std::collections::VecDeque;
use std::sync::Arc;

use track_common::event::TrackEvent;

use crate::cache::{CacheStore, QUEUE_SLOT};
use crate::error::CacheError;

/// Ordered buffer of events awaiting transmission, mirrored to a cache slot.
///
/// The mirror holds the in-flight batch followed by `pending`, so a crash while a
/// batch is on the wire still recovers it on the next [`ClientQueue::load`].
pub struct ClientQueue {
    pending: VecDeque<TrackEvent>,
    in_flight: Option<Vec<TrackEvent>>,
    cache: Arc<dyn CacheStore>,
}

impl ClientQueue {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            cache,
        }
    }

    /// Recover events persisted by a previous session. A missing or unreadable
    /// slot yields an empty queue.
    pub fn load(cache: Arc<dyn CacheStore>) -> Self {
        let recovered = match cache.load(QUEUE_SLOT) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<TrackEvent>>(&raw) {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("discarding unreadable event cache: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("failed to read event cache: {}", e);
                Vec::new()
            }
        };

        if !recovered.is_empty() {
            tracing::info!(events = recovered.len(), "recovered cached events");
        }

        Self {
            pending: recovered.into(),
            in_flight: None,
            cache,
        }
    }

    /// Append an event and persist. On `Err` the event is still queued in memory.
    pub fn enqueue(&mut self, event: TrackEvent) -> Result<(), CacheError> {
        self.pending.push_back(event);
        self.persist()
    }

    /// Take every pending event, oldest first.
    pub fn drain_all(&mut self) -> Vec<TrackEvent> {
        self.pending.drain(..).collect()
    }

    /// Put `events` back in front of anything enqueued since they were drained.
    pub fn restore(&mut self, events: Vec<TrackEvent>) -> Result<(), CacheError> {
        for event in events.into_iter().rev() {
            self.pending.push_front(event);
        }
        self.persist()
    }

    pub fn clear_persisted(&self) -> Result<(), CacheError> {
        self.cache.remove(QUEUE_SLOT)
    }

    /// Overwrite the cache slot with the in-flight batch and the pending events.
    pub fn persist(&self) -> Result<(), CacheError> {
        let snapshot: Vec<&TrackEvent> = self
            .in_flight
            .iter()
            .flatten()
            .chain(self.pending.iter())
            .collect();
        let payload = serde_json::to_string(&snapshot)?;
        self.cache.save(QUEUE_SLOT, &payload)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> Vec<TrackEvent> {
        self.pending.iter().cloned().collect()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Idle → Sending: drain the queue unless it is empty or a batch is already in flight.
    pub(crate) fn begin_flight(&mut self) -> Option<Vec<TrackEvent>> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        let batch = self.drain_all();
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// Sending → Idle after a confirmed delivery.
    pub(crate) fn complete_flight(&mut self) -> Result<(), CacheError> {
        self.in_flight = None;
        if self.pending.is_empty() {
            self.clear_persisted()
        } else {
            // Events enqueued while sending must stay recoverable
            self.persist()
        }
    }

    /// Sending → Idle after a failed delivery: the batch goes back to the front.
    pub(crate) fn abort_flight(&mut self, batch: Vec<TrackEvent>) -> Result<(), CacheError> {
        self.in_flight = None;
        self.restore(batch)
    }
}
