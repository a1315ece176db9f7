use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tracing::instrument;
use track_common::event::{CleanedEvent, EventData};
use track_common::health::HealthHandle;
use track_common::intake::IntakeQueue;
use track_common::retry::RetryPolicy;
use track_common::time::{SystemTime, TimeSource};

use crate::error::ConsumerError;
use crate::sink::EventSink;

fn report_dropped_events(cause: &'static str, quantity: u64) {
    counter!("cleaner_events_dropped_total", "cause" => cause).increment(quantity);
}

/// Validate, deduplicate and normalize one popped batch.
///
/// Events without a `type` or `userId` are dropped. Of events sharing a
/// `userId-timestamp-type` key, the first one wins. A missing timestamp becomes
/// `now` and `data` is serialized to its JSON text, `{}` when absent.
pub fn clean_batch(events: Vec<EventData>, now: &str) -> Result<Vec<CleanedEvent>, ConsumerError> {
    let mut seen = HashSet::with_capacity(events.len());
    let mut cleaned = Vec::with_capacity(events.len());

    for event in events {
        if !event.has_required_fields() {
            report_dropped_events("missing_required_field", 1);
            continue;
        }
        if !seen.insert(event.dedup_key()) {
            report_dropped_events("duplicate", 1);
            continue;
        }

        let EventData {
            event_type,
            user_id,
            data,
            timestamp,
        } = event;

        let data = match data {
            None | Some(Value::Null) => "{}".to_owned(),
            Some(data) => serde_json::to_string(&data).map_err(ConsumerError::Encode)?,
        };

        cleaned.push(CleanedEvent {
            timestamp: timestamp
                .filter(|timestamp| !timestamp.is_empty())
                .unwrap_or_else(|| now.to_owned()),
            event_type: event_type.unwrap_or_default(),
            user_id: user_id.unwrap_or_default(),
            data,
        });
    }

    Ok(cleaned)
}

/// Pops batches from the intake queue one at a time and commits them to the sink.
pub struct CleanerWorker {
    /// An identifier for this worker, used in logs and liveness.
    name: String,
    queue: Arc<dyn IntakeQueue + Send + Sync>,
    sink: Arc<dyn EventSink + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    /// How long a single pop may block. `None` blocks until a batch arrives.
    pop_timeout: Option<Duration>,
    /// Pause after a failed batch before popping the next one.
    error_backoff: Duration,
    /// Governs repeated commit attempts of one batch.
    retry_policy: RetryPolicy,
    /// Batches that could not be decoded or committed are pushed here when set.
    dead_letter: Option<Arc<dyn IntakeQueue + Send + Sync>>,
    /// The liveness check handle, reported on every loop iteration.
    liveness: HealthHandle,
}

impl CleanerWorker {
    pub fn new(
        name: &str,
        queue: Arc<dyn IntakeQueue + Send + Sync>,
        sink: Arc<dyn EventSink + Send + Sync>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            sink,
            timesource: Arc::new(SystemTime {}),
            pop_timeout: Some(Duration::from_secs(5)),
            error_backoff: Duration::from_millis(5000),
            retry_policy: RetryPolicy::no_retry(),
            dead_letter: None,
            liveness,
        }
    }

    pub fn time_source(mut self, timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.timesource = timesource;
        self
    }

    pub fn pop_timeout(mut self, pop_timeout: Option<Duration>) -> Self {
        self.pop_timeout = pop_timeout;
        self
    }

    pub fn error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn dead_letter(mut self, queue: Arc<dyn IntakeQueue + Send + Sync>) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    /// Run until the task is dropped. A failed batch is logged and abandoned, and
    /// the loop resumes after `error_backoff`.
    pub async fn run(&self) {
        loop {
            self.liveness.report_healthy().await;

            if let Err(error) = self.step().await {
                tracing::error!(worker = %self.name, "failed to process batch: {}", error);
                tokio::time::sleep(self.error_backoff).await;
            }
        }
    }

    /// Pop at most one batch and process it. Returns the number of inserted
    /// events, or `None` when the pop timed out.
    pub async fn step(&self) -> Result<Option<usize>, ConsumerError> {
        let Some(raw) = self.queue.pop_blocking(self.pop_timeout).await? else {
            return Ok(None);
        };

        let processed = self.process_batch(&raw).await;

        match self.queue.depth().await {
            Ok(depth) => gauge!("cleaner_intake_queue_depth").set(depth as f64),
            Err(e) => tracing::debug!("failed to read intake queue depth: {}", e),
        }

        processed.map(Some)
    }

    #[instrument(skip_all, fields(worker = %self.name, batch_bytes = raw.len()))]
    pub async fn process_batch(&self, raw: &str) -> Result<usize, ConsumerError> {
        let events: Vec<EventData> = match serde_json::from_str(raw) {
            Ok(events) => events,
            Err(e) => {
                counter!("cleaner_batches_total", "outcome" => "undecodable").increment(1);
                self.send_to_dead_letter(raw).await;
                return Err(e.into());
            }
        };
        histogram!("cleaner_batch_size").record(events.len() as f64);

        let now = self.timesource.current_time();
        let cleaned = clean_batch(events, &now)?;
        if cleaned.is_empty() {
            counter!("cleaner_batches_total", "outcome" => "empty").increment(1);
            return Ok(0);
        }

        if let Err(e) = self.commit(&cleaned).await {
            counter!("cleaner_batches_total", "outcome" => "failed").increment(1);
            self.send_to_dead_letter(raw).await;
            return Err(e);
        }

        counter!("cleaner_batches_total", "outcome" => "inserted").increment(1);
        counter!("cleaner_events_inserted_total").increment(cleaned.len() as u64);
        tracing::debug!(events = cleaned.len(), "committed batch");

        Ok(cleaned.len())
    }

    async fn commit(&self, records: &[CleanedEvent]) -> Result<(), ConsumerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.bulk_insert(records).await {
                Ok(()) => return Ok(()),
                Err(error) if self.retry_policy.should_retry(attempt) => {
                    let interval = self.retry_policy.retry_interval(attempt);
                    tracing::warn!(attempt, ?interval, "commit failed, retrying: {}", error);
                    tokio::time::sleep(interval).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn send_to_dead_letter(&self, raw: &str) {
        let Some(queue) = &self.dead_letter else {
            tracing::error!(worker = %self.name, bytes = raw.len(), "dropping batch");
            return;
        };

        match queue.push(raw.to_owned()).await {
            Ok(()) => counter!("cleaner_batches_dead_lettered_total").increment(1),
            Err(e) => tracing::error!("failed to dead-letter batch, dropping it: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use track_common::health::HealthRegistry;
    use track_common::intake::MemoryQueue;
    use track_common::time::FixedTime;

    use super::*;
    use crate::sink::MemorySink;

    const NOW: &str = "2024-06-01T00:00:00Z";

    fn events(value: Value) -> Vec<EventData> {
        serde_json::from_value(value).unwrap()
    }

    async fn worker(queue: &MemoryQueue, sink: &MemorySink) -> (CleanerWorker, HealthRegistry) {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("cleaner-worker-0".to_owned(), Duration::from_secs(30))
            .await;
        let worker = CleanerWorker::new(
            "cleaner-worker-0",
            Arc::new(queue.clone()),
            Arc::new(sink.clone()),
            liveness,
        )
        .time_source(Arc::new(FixedTime {
            time: NOW.to_owned(),
        }))
        .pop_timeout(Some(Duration::from_millis(50)))
        .error_backoff(Duration::from_millis(10));

        (worker, registry)
    }

    #[test]
    fn keeps_first_of_duplicates_and_drops_invalid() {
        let batch = events(json!([
            {"type": "click", "userId": "u1", "timestamp": "2024-01-01T00:00:00Z", "data": {"x": 1}},
            {"type": "click", "userId": "u1", "timestamp": "2024-01-01T00:00:00Z", "data": {"x": 2}},
            {"type": "", "userId": "u2"},
        ]));

        let cleaned = clean_batch(batch, NOW).unwrap();

        assert_eq!(
            cleaned,
            vec![CleanedEvent {
                timestamp: "2024-01-01T00:00:00Z".to_owned(),
                event_type: "click".to_owned(),
                user_id: "u1".to_owned(),
                data: r#"{"x":1}"#.to_owned(),
            }]
        );
    }

    #[test]
    fn normalizes_missing_fields() {
        let batch = events(json!([
            {"type": "pv", "userId": "u1"},
            {"type": "pv", "userId": "u2", "timestamp": "", "data": null},
            {"type": "error", "userId": "u3", "timestamp": "t", "data": {"b": 2, "a": [1, "x"]}},
        ]));

        let cleaned = clean_batch(batch, NOW).unwrap();

        assert_eq!(cleaned.len(), 3);
        assert_eq!(cleaned[0].timestamp, NOW);
        assert_eq!(cleaned[0].data, "{}");
        assert_eq!(cleaned[1].timestamp, NOW);
        assert_eq!(cleaned[1].data, "{}");
        assert_eq!(cleaned[2].timestamp, "t");
        assert_eq!(cleaned[2].data, r#"{"a":[1,"x"],"b":2}"#);
    }

    #[test]
    fn missing_and_empty_timestamps_share_a_key() {
        let batch = events(json!([
            {"type": "pv", "userId": "u1"},
            {"type": "pv", "userId": "u1", "timestamp": ""},
            {"type": "uv", "userId": "u1"},
        ]));

        let cleaned = clean_batch(batch, NOW).unwrap();

        let types: Vec<&str> = cleaned.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["pv", "uv"]);
    }

    #[test]
    fn cleaning_is_idempotent_across_redelivery() {
        let batch = events(json!([
            {"type": "click", "userId": "u1", "timestamp": "t1", "data": {"x": 1}},
            {"type": "route", "userId": "u1", "timestamp": "t1", "data": {"from": "/", "to": "/a"}},
        ]));
        let mut redelivered = batch.clone();
        redelivered.extend(batch.clone());

        assert_eq!(
            clean_batch(batch, NOW).unwrap(),
            clean_batch(redelivered, NOW).unwrap()
        );
    }

    #[tokio::test]
    async fn step_commits_one_batch() {
        let queue = MemoryQueue::new();
        let sink = MemorySink::new();
        let (worker, _) = worker(&queue, &sink).await;
        queue
            .push(json!([{"type": "pv", "userId": "u1", "timestamp": "t"}]).to_string())
            .await
            .unwrap();

        assert_eq!(worker.step().await.unwrap(), Some(1));
        assert_eq!(worker.step().await.unwrap(), None);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_not_committed() {
        let queue = MemoryQueue::new();
        let sink = MemorySink::new();
        let (worker, _) = worker(&queue, &sink).await;

        let inserted = worker
            .process_batch(&json!([{"userId": "u1"}]).to_string())
            .await
            .unwrap();

        assert_eq!(inserted, 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn mistyped_event_does_not_sink_its_batch() {
        let queue = MemoryQueue::new();
        let sink = MemorySink::new();
        let (worker, _) = worker(&queue, &sink).await;

        let inserted = worker
            .process_batch(
                r#"[{"type":"pv","userId":"u1","timestamp":"t"},{"type":"pv","userId":42,"timestamp":"t"},{"type":{},"userId":"u3"},7]"#,
            )
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        let users: Vec<String> = sink.records().into_iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec!["u1", "42"]);
    }

    #[tokio::test]
    async fn commit_is_retried_within_policy() {
        let queue = MemoryQueue::new();
        let sink = MemorySink::new();
        sink.fail_next(1);
        let (worker, _) = worker(&queue, &sink).await;
        let worker =
            worker.retry_policy(RetryPolicy::new(2, Duration::from_millis(10), None, 2));

        let inserted = worker
            .process_batch(&json!([{"type": "pv", "userId": "u1"}]).to_string())
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_commits_are_dead_lettered() {
        let queue = MemoryQueue::new();
        let dead_letter = MemoryQueue::new();
        let sink = MemorySink::new();
        sink.fail_next(2);
        let (worker, _) = worker(&queue, &sink).await;
        let worker = worker
            .retry_policy(RetryPolicy::new(2, Duration::from_millis(10), None, 2))
            .dead_letter(Arc::new(dead_letter.clone()));

        let raw = json!([{"type": "pv", "userId": "u1"}]).to_string();
        let result = worker.process_batch(&raw).await;

        assert!(matches!(result, Err(ConsumerError::Sink(_))));
        assert!(sink.batches().is_empty());
        assert_eq!(dead_letter.snapshot().await, vec![raw]);
    }

    #[tokio::test]
    async fn undecodable_batch_is_dead_lettered() {
        let queue = MemoryQueue::new();
        let dead_letter = MemoryQueue::new();
        let sink = MemorySink::new();
        let (worker, _) = worker(&queue, &sink).await;
        let worker = worker.dead_letter(Arc::new(dead_letter.clone()));

        let result = worker.process_batch("{\"not\": \"an array\"}").await;

        assert!(matches!(result, Err(ConsumerError::Decode(_))));
        assert_eq!(
            dead_letter.snapshot().await,
            vec!["{\"not\": \"an array\"}".to_owned()]
        );
    }

    #[tokio::test]
    async fn run_survives_bad_batches() {
        let queue = MemoryQueue::new();
        let sink = MemorySink::new();
        let (worker, registry) = worker(&queue, &sink).await;

        queue.push("garbage".to_owned()).await.unwrap();
        queue
            .push(json!([{"type": "pv", "userId": "u1", "timestamp": "t"}]).to_string())
            .await
            .unwrap();

        let running = tokio::spawn(async move { worker.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.records().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch after the bad one was never committed");

        assert!(registry.get_status().healthy);
        running.abort();
    }
}
