use thiserror::Error;
use track_common::intake::QueueError;

/// Failures writing a batch to a sink. A failed `bulk_insert` wrote nothing.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sink rejected the batch: {0}")]
    Rejected(String),
}

/// Enumeration of errors that abandon a single popped batch.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to decode batch: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode event data: {0}")]
    Encode(serde_json::Error),
    #[error("intake queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to commit batch: {0}")]
    Sink(#[from] SinkError),
}
