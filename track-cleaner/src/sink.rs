use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use sqlx::postgres::{PgPool, PgPoolOptions};
use track_common::event::CleanedEvent;

use crate::error::SinkError;

/// Destination of cleaned batches. One call is all-or-nothing.
#[async_trait]
pub trait EventSink {
    async fn bulk_insert(&self, records: &[CleanedEvent]) -> Result<(), SinkError>;
}

/// Writes each batch in a single transaction, as one multi-row insert.
pub struct PgSink {
    table: String,
    pool: PgPool,
}

impl PgSink {
    pub async fn new(url: &str, table: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, table))
    }

    pub fn from_pool(pool: PgPool, table: &str) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for PgSink {
    async fn bulk_insert(&self, records: &[CleanedEvent]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut timestamps = Vec::with_capacity(records.len());
        let mut types = Vec::with_capacity(records.len());
        let mut user_ids = Vec::with_capacity(records.len());
        let mut data = Vec::with_capacity(records.len());
        for record in records {
            timestamps.push(record.timestamp.clone());
            types.push(record.event_type.clone());
            user_ids.push(record.user_id.clone());
            data.push(record.data.clone());
        }

        // Using the "unnest" function to turn parallel arrays into a set of rows
        let query = format!(
            r#"
INSERT INTO "{0}"
    (timestamp, type, user_id, data)
SELECT *
FROM UNNEST(
    $1::text[],
    $2::text[],
    $3::text[],
    $4::text[]
)
            "#,
            &self.table
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&query)
            .bind(timestamps)
            .bind(types)
            .bind(user_ids)
            .bind(data)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }
}

/// Logs records instead of storing them, for local runs.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn bulk_insert(&self, records: &[CleanedEvent]) -> Result<(), SinkError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        for record in records {
            tracing::info!("event: {:?}", record);
        }
        counter!("cleaner_print_sink_events_total").increment(records.len() as u64);

        Ok(())
    }
}

/// Keeps committed batches in memory. Can be told to reject upcoming inserts.
#[derive(Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<CleanedEvent>>>>,
    failures: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `inserts` calls.
    pub fn fail_next(&self, inserts: usize) {
        self.failures.store(inserts, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<CleanedEvent>> {
        self.batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<CleanedEvent> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn bulk_insert(&self, records: &[CleanedEvent]) -> Result<(), SinkError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected("memory sink told to fail".to_owned()));
        }

        self.batches
            .lock()
            .map_err(|_| SinkError::Rejected("poisoned memory sink".to_owned()))?
            .push(records.to_vec());
        Ok(())
    }
}
