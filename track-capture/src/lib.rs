pub mod api;
pub mod config;
pub mod report;
pub mod router;
pub mod server;
