//! Metrics and monitoring
//!
//! Request handling reports (kind, success, latency) and proxy invocations
//! through a non-blocking sink; a collector aggregates them into snapshots.

pub mod collector;
pub mod monitor;

pub use collector::{
    CommandMetric, HealthState, MetricEvent, MetricsCollector, MetricsSink, Snapshot,
};
pub use monitor::{ActiveConnections, MonitoringService};
