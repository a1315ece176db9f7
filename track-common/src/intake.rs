//! Durable FIFO of raw event batches between the collection tier and the cleaner.
//!
//! Delivery is at-least-once on the producer side (a push may be retried by the
//! caller) and there is no acknowledgement on the consumer side: once
//! `pop_blocking` returns a batch, the caller owns it and a crash loses it.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

/// Queue name used by the collection tier and the cleaner.
pub const DEFAULT_QUEUE_NAME: &str = "monitoring-data";

// Pushes are single RPUSH calls, anything slower means redis is unavailable
const REDIS_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("{command} timed out")]
    Timeout { command: &'static str },
}

#[async_trait]
pub trait IntakeQueue {
    /// Append a JSON-encoded batch at the tail.
    async fn push(&self, batch: String) -> Result<(), QueueError>;

    /// Remove and return the oldest batch, waiting until one is available.
    /// `None` waits forever; otherwise `Ok(None)` is returned once `wait` elapses.
    async fn pop_blocking(&self, wait: Option<Duration>) -> Result<Option<String>, QueueError>;

    /// Number of batches waiting.
    async fn depth(&self) -> Result<usize, QueueError>;
}

/// Redis list backed queue: RPUSH at the tail, BLPOP from the head.
pub struct RedisQueue {
    client: redis::Client,
    name: String,
}

impl RedisQueue {
    pub fn new(addr: &str, name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(addr)?;

        Ok(Self {
            client,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// BLPOP timeout in seconds. Redis accepts fractions, and 0 blocks forever.
fn blpop_timeout(wait: Option<Duration>) -> f64 {
    wait.map(|wait| wait.as_secs_f64()).unwrap_or(0.0)
}

#[async_trait]
impl IntakeQueue for RedisQueue {
    async fn push(&self, batch: String) -> Result<(), QueueError> {
        let mut conn = self.client.get_async_connection().await?;

        let push = conn.rpush::<_, _, usize>(&self.name, batch);
        let depth = timeout(REDIS_PUSH_TIMEOUT, push)
            .await
            .map_err(|_| QueueError::Timeout { command: "RPUSH" })??;

        tracing::debug!(queue = %self.name, depth, "pushed batch");
        Ok(())
    }

    async fn pop_blocking(&self, wait: Option<Duration>) -> Result<Option<String>, QueueError> {
        let seconds = blpop_timeout(wait);

        // A blocking pop holds its connection, so it gets its own
        let mut conn = self.client.get_async_connection().await?;
        let popped: Option<(String, String)> = conn.blpop(&self.name, seconds).await?;

        Ok(popped.map(|(_, batch)| batch))
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.client.get_async_connection().await?;
        let depth: usize = conn.llen(&self.name).await?;

        Ok(depth)
    }
}

/// In-process queue with the same semantics, for tests and single-binary setups.
/// Clones share the same underlying queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    batches: Mutex<VecDeque<String>>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the waiting batches, oldest first.
    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.batches.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl IntakeQueue for MemoryQueue {
    async fn push(&self, batch: String) -> Result<(), QueueError> {
        self.inner.batches.lock().await.push_back(batch);
        self.inner.available.notify_one();
        Ok(())
    }

    async fn pop_blocking(&self, wait: Option<Duration>) -> Result<Option<String>, QueueError> {
        let deadline = wait.map(|wait| tokio::time::Instant::now() + wait);

        loop {
            // Register interest before checking, so a push in between is not missed
            let notified = self.inner.available.notified();

            if let Some(batch) = self.inner.batches.lock().await.pop_front() {
                return Ok(Some(batch));
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.inner.batches.lock().await.len())
    }
}
