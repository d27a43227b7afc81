//! Telemetry module for GG-CACHE.
//!
//! Structured logging, `metrics` facade recorders and periodic stats
//! snapshots. No exporter or network sink is installed here.

mod logging;
pub mod metrics;
mod snapshot;

pub use logging::{build_filter, init_logging, LogConfig, LogError, LogFormat};
pub(crate) use snapshot::mean_duration;
pub use snapshot::{StatsExporter, StatsSnapshot};
