//! Supervision layer: consumer groups, worker lifecycle, group health, and
//! the periodic stats report.

pub mod stats;
pub mod supervisor;

pub use stats::{LogStatsSink, MetricsSink};
pub use supervisor::{Supervisor, SupervisorOptions, DEFAULT_STATS_INTERVAL};
