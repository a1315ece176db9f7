//! Drains the intake queue, deduplicates each batch and commits it to a sink.
pub mod config;
pub mod consumer;
pub mod error;
pub mod router;
pub mod sink;
