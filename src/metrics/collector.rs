//! Command metrics collection
//!
//! Connections report through a [`MetricsSink`], which only pushes onto an
//! unbounded channel. A collector task drains the channel and aggregates.

use crate::network::message::MessageKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Label used for lines whose kind could not be determined
pub const INVALID_COMMAND: &str = "??";

/// A single metric event
#[derive(Debug, Clone)]
pub enum MetricEvent {
    Command {
        kind: Option<MessageKind>,
        success: bool,
        latency: Duration,
    },
    Proxy,
}

/// Fire-and-forget handle for reporting metrics
#[derive(Clone, Debug, Default)]
pub struct MetricsSink {
    tx: Option<mpsc::UnboundedSender<MetricEvent>>,
}

impl MetricsSink {
    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: MetricEvent) {
        if let Some(tx) = &self.tx {
            // Collector gone during shutdown; nothing to do.
            let _ = tx.send(event);
        }
    }

    /// A request was handled
    pub fn command(&self, kind: Option<MessageKind>, success: bool, latency: Duration) {
        self.emit(MetricEvent::Command {
            kind,
            success,
            latency,
        });
    }

    /// A request was relayed to another bank
    pub fn proxy(&self) {
        self.emit(MetricEvent::Proxy);
    }
}

/// Overall node health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Ok,
    Degraded,
}

/// Point-in-time node statistics
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub created_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub health: HealthState,
    pub active_connections: usize,
    pub total_commands: u64,
    pub proxy_commands: u64,
    pub error_count: u64,
    pub persistence_strategy: String,
}

/// Aggregated statistics for one command kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMetric {
    pub command: String,
    pub execution_count: u64,
    pub error_count: u64,
    pub avg_execution_ms: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct CommandStats {
    count: u64,
    errors: u64,
    total: Duration,
}

/// Running counters
#[derive(Debug, Default)]
pub struct Counters {
    total: u64,
    proxy: u64,
    errors: u64,
    commands: BTreeMap<&'static str, CommandStats>,
}

impl Counters {
    pub fn record(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::Command {
                kind,
                success,
                latency,
            } => {
                self.total += 1;
                let name = kind.map(MessageKind::code).unwrap_or(INVALID_COMMAND);
                let stats = self.commands.entry(name).or_default();
                stats.count += 1;
                stats.total += latency;
                if !success {
                    self.errors += 1;
                    stats.errors += 1;
                }
            }
            MetricEvent::Proxy => self.proxy += 1,
        }
    }

    pub fn command_metrics(&self) -> Vec<CommandMetric> {
        self.commands
            .iter()
            .map(|(name, stats)| CommandMetric {
                command: name.to_string(),
                execution_count: stats.count,
                error_count: stats.errors,
                avg_execution_ms: if stats.count == 0 {
                    0.0
                } else {
                    stats.total.as_secs_f64() * 1000.0 / stats.count as f64
                },
            })
            .collect()
    }
}

/// Aggregates metric events for the whole node
pub struct MetricsCollector {
    started: DateTime<Utc>,
    strategy: String,
    counters: RwLock<Counters>,
}

impl MetricsCollector {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            started: Utc::now(),
            strategy: strategy.into(),
            counters: RwLock::new(Counters::default()),
        }
    }

    /// Start a collector task, returning the collector and a sink feeding it
    pub fn spawn(
        strategy: impl Into<String>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, MetricsSink) {
        let collector = Arc::new(Self::new(strategy));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task_collector = collector.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => task_collector.record(event).await,
                        None => break,
                    },
                }
            }
            log::debug!("Metrics collector stopped");
        });

        (collector, MetricsSink { tx: Some(tx) })
    }

    pub async fn record(&self, event: MetricEvent) {
        self.counters.write().await.record(event);
    }

    pub async fn snapshot(&self, active_connections: usize) -> Snapshot {
        let counters = self.counters.read().await;
        let now = Utc::now();
        Snapshot {
            created_at: now,
            uptime_seconds: (now - self.started).num_seconds(),
            health: if counters.errors > 0 {
                HealthState::Degraded
            } else {
                HealthState::Ok
            },
            active_connections,
            total_commands: counters.total,
            proxy_commands: counters.proxy,
            error_count: counters.errors,
            persistence_strategy: self.strategy.clone(),
        }
    }

    pub async fn command_metrics(&self) -> Vec<CommandMetric> {
        self.counters.read().await.command_metrics()
    }

    /// Per-command metrics since the last reset, then reset them
    pub async fn command_metrics_and_reset(&self) -> Vec<CommandMetric> {
        let mut counters = self.counters.write().await;
        let metrics = counters.command_metrics();
        counters.commands.clear();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(kind: MessageKind, success: bool, ms: u64) -> MetricEvent {
        MetricEvent::Command {
            kind: Some(kind),
            success,
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_counters_aggregate() {
        let mut counters = Counters::default();
        counters.record(command(MessageKind::AccountDeposit, true, 10));
        counters.record(command(MessageKind::AccountDeposit, false, 30));
        counters.record(MetricEvent::Command {
            kind: None,
            success: false,
            latency: Duration::ZERO,
        });
        counters.record(MetricEvent::Proxy);

        assert_eq!(counters.total, 3);
        assert_eq!(counters.errors, 2);
        assert_eq!(counters.proxy, 1);

        let metrics = counters.command_metrics();
        let deposit = metrics.iter().find(|m| m.command == "AD").unwrap();
        assert_eq!(deposit.execution_count, 2);
        assert_eq!(deposit.error_count, 1);
        assert!((deposit.avg_execution_ms - 20.0).abs() < 1e-9);
        assert!(metrics.iter().any(|m| m.command == INVALID_COMMAND));
    }

    #[tokio::test]
    async fn test_snapshot_and_reset() {
        let collector = MetricsCollector::new("MEMORY");
        collector.record(command(MessageKind::BankCode, true, 1)).await;

        let snapshot = collector.snapshot(3).await;
        assert_eq!(snapshot.health, HealthState::Ok);
        assert_eq!(snapshot.active_connections, 3);
        assert_eq!(snapshot.total_commands, 1);
        assert_eq!(snapshot.persistence_strategy, "MEMORY");

        assert_eq!(collector.command_metrics_and_reset().await.len(), 1);
        assert!(collector.command_metrics().await.is_empty());
        // Totals are not reset with the per-command figures
        assert_eq!(collector.snapshot(0).await.total_commands, 1);

        collector.record(command(MessageKind::BankCode, false, 1)).await;
        assert_eq!(collector.snapshot(0).await.health, HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_sink_feeds_collector() {
        let shutdown = CancellationToken::new();
        let (collector, sink) = MetricsCollector::spawn("CSV", shutdown.clone());
        sink.proxy();
        sink.command(Some(MessageKind::AccountCreate), true, Duration::from_millis(2));

        for _ in 0..50 {
            if collector.snapshot(0).await.total_commands == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = collector.snapshot(0).await;
        assert_eq!(snapshot.total_commands, 1);
        assert_eq!(snapshot.proxy_commands, 1);

        shutdown.cancel();
        // Sending after shutdown must not panic or block
        sink.proxy();
        MetricsSink::disabled().proxy();
    }
}
