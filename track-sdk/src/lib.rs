//! Client side of the telemetry pipeline.
//!
//! Events are normalized by the [`encoder`], buffered by the [`queue`] with a
//! durable mirror in a [`cache`], and delivered by the [`flush`] controller through
//! a [`transport`]. [`monitor::Monitor`] ties these together behind the
//! collection entry points a host application calls.
pub mod cache;
pub mod encoder;
pub mod error;
pub mod flush;
pub mod monitor;
pub mod options;
pub mod queue;
pub mod transport;

pub use error::{CacheError, MonitorError, TransportError};
pub use flush::FlushOutcome;
pub use monitor::{ErrorReport, Monitor, MonitorBuilder, PerformanceTiming, RouteObserver};
pub use options::{MonitorOptions, PayloadFormat};
