//! REST API handlers for node status

use crate::metrics::{CommandMetric, MetricsCollector, Snapshot};
use crate::network::connection::ConnectionInfo;
use crate::network::manager::ConnectionManager;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub bank_code: Ipv4Addr,
    pub port: u16,
    pub collector: Arc<MetricsCollector>,
    pub manager: Arc<ConnectionManager>,
    pub shutdown: CancellationToken,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub bank_code: Ipv4Addr,
    pub port: u16,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Health check
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /api/status - Node snapshot
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state
        .collector
        .snapshot(state.manager.active_connections())
        .await;

    Json(StatusResponse {
        bank_code: state.bank_code,
        port: state.port,
        snapshot,
    })
}

/// GET /api/connections - Live connections
pub async fn get_connections(State(state): State<ApiState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.manager.connections_info().await)
}

/// GET /api/commands - Per-command metrics since the last snapshot
pub async fn get_commands(State(state): State<ApiState>) -> Json<Vec<CommandMetric>> {
    Json(state.collector.command_metrics().await)
}

/// POST /api/shutdown - Stop the node
pub async fn shutdown(State(state): State<ApiState>) -> (StatusCode, Json<ShutdownResponse>) {
    log::info!("Shutdown requested through the API");
    state.shutdown.cancel();
    (
        StatusCode::ACCEPTED,
        Json(ShutdownResponse {
            message: format!("Bank {} is shutting down", state.bank_code),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::metrics::{MetricEvent, MetricsSink};
    use crate::network::connection::ConnectionContext;
    use crate::network::handler::RequestHandler;
    use crate::network::message::MessageKind;
    use std::time::Duration;

    fn state() -> ApiState {
        let bank_code = Ipv4Addr::new(10, 0, 0, 1);
        let shutdown = CancellationToken::new();
        let handler = RequestHandler::new(Arc::new(MemoryLedger::new()), bank_code);
        let ctx = Arc::new(ConnectionContext::new(handler, MetricsSink::disabled()));
        ApiState {
            bank_code,
            port: 65525,
            collector: Arc::new(MetricsCollector::new("MEMORY")),
            manager: ConnectionManager::new(ctx, shutdown.clone()),
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_status() {
        let state = state();
        state
            .collector
            .record(MetricEvent::Command {
                kind: Some(MessageKind::AccountCreate),
                success: true,
                latency: Duration::from_millis(3),
            })
            .await;

        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.port, 65525);
        assert_eq!(status.snapshot.total_commands, 1);
        assert_eq!(status.snapshot.active_connections, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["bank_code"], "10.0.0.1");
        assert_eq!(json["persistence_strategy"], "MEMORY");

        let Json(commands) = get_commands(State(state.clone())).await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command, "AC");

        let Json(connections) = get_connections(State(state)).await;
        assert!(connections.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let state = state();
        let (code, _) = shutdown(State(state.clone())).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_health() {
        let Json(health) = health_check().await;
        assert_eq!(health.status, "ok");
    }
}
