//! Periodic node snapshots

use crate::metrics::collector::{MetricsCollector, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Source of the live connection count
pub type ActiveConnections = Arc<dyn Fn() -> usize + Send + Sync>;

/// Logs a snapshot and the per-command metrics at a fixed interval
pub struct MonitoringService {
    collector: Arc<MetricsCollector>,
    active_connections: ActiveConnections,
    interval: Duration,
}

impl MonitoringService {
    pub fn new(
        collector: Arc<MetricsCollector>,
        active_connections: ActiveConnections,
        interval: Duration,
    ) -> Self {
        Self {
            collector,
            active_connections,
            interval,
        }
    }

    /// Take one snapshot and log it; per-command figures are reset
    pub async fn tick(&self) -> Snapshot {
        let snapshot = self.collector.snapshot((self.active_connections)()).await;
        match serde_json::to_string(&snapshot) {
            Ok(json) => log::info!("Snapshot {}", json),
            Err(e) => log::warn!("Failed to serialize snapshot: {}", e),
        }

        for metric in self.collector.command_metrics_and_reset().await {
            log::debug!(
                "Command {}: {} executed, {} failed, {:.2}ms avg",
                metric.command,
                metric.execution_count,
                metric.error_count,
                metric.avg_execution_ms
            );
        }
        snapshot
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        log::info!("Monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::collector::MetricEvent;
    use crate::network::message::MessageKind;

    #[tokio::test]
    async fn test_tick_reports_connections_and_resets_commands() {
        let collector = Arc::new(MetricsCollector::new("MEMORY"));
        collector
            .record(MetricEvent::Command {
                kind: Some(MessageKind::BankAmount),
                success: true,
                latency: Duration::from_millis(1),
            })
            .await;

        let service = MonitoringService::new(
            collector.clone(),
            Arc::new(|| 4),
            Duration::from_secs(10),
        );
        let snapshot = service.tick().await;
        assert_eq!(snapshot.active_connections, 4);
        assert_eq!(snapshot.total_commands, 1);
        assert!(collector.command_metrics().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let collector = Arc::new(MetricsCollector::new("MEMORY"));
        let service =
            MonitoringService::new(collector, Arc::new(|| 0), Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(service.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
