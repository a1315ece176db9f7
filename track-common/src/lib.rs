pub mod config;
pub mod event;
pub mod health;
pub mod intake;
pub mod metrics;
pub mod retry;
pub mod time;
