//! Bank node
//!
//! Wires the ledger, metrics, connection manager and optional status API
//! together and runs them until shutdown.

use crate::api::{self, ApiState};
use crate::config::{ConfigError, NodeConfig, StorageKind};
use crate::ledger::{CsvLedger, Ledger, LedgerError, MemoryLedger};
use crate::metrics::{ActiveConnections, MetricsCollector, MonitoringService};
use crate::network::connection::ConnectionContext;
use crate::network::handler::RequestHandler;
use crate::network::manager::ConnectionManager;
use crate::network::server::{Server, DISCOVERY_PORTS};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Node startup errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Open the ledger selected by the configuration
pub fn open_ledger(config: &NodeConfig) -> Result<Arc<dyn Ledger>, LedgerError> {
    match config.storage {
        StorageKind::Csv => Ok(Arc::new(CsvLedger::in_dir(&config.data_dir)?)),
        StorageKind::Memory => Ok(Arc::new(MemoryLedger::new())),
    }
}

/// A bank node
pub struct BankNode {
    config: NodeConfig,
    bank_code: Ipv4Addr,
    ledger: Arc<dyn Ledger>,
    shutdown: CancellationToken,
}

impl BankNode {
    /// Create a node, opening the configured ledger
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let ledger = open_ledger(&config)?;
        Ok(Self::with_ledger(config, ledger))
    }

    pub fn with_ledger(config: NodeConfig, ledger: Arc<dyn Ledger>) -> Self {
        let bank_code = config.resolve_bank_code();
        Self {
            config,
            bank_code,
            ledger,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bank_code(&self) -> Ipv4Addr {
        self.bank_code
    }

    /// Token that stops the node when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured port, or the first free bank port
    pub async fn bind(&self) -> Result<Server, NodeError> {
        let server = match self.config.port {
            Some(port) => Server::bind(port).await?,
            None => Server::bind_in_range(DISCOVERY_PORTS).await?,
        };
        Ok(server)
    }

    /// Bind and serve until shutdown
    pub async fn start(&self) -> Result<(), NodeError> {
        let server = self.bind().await?;
        self.serve(server).await;
        Ok(())
    }

    /// Serve connections on `server` until shutdown
    pub async fn serve(&self, server: Server) {
        let port = server.port();
        let (collector, metrics) =
            MetricsCollector::spawn(self.ledger.strategy_name(), self.shutdown.clone());

        let ctx = Arc::new(ConnectionContext {
            handler: RequestHandler::new(self.ledger.clone(), self.bank_code),
            metrics,
            read_timeout: self.config.read_timeout,
            dial_timeout: self.config.dial_timeout,
        });
        let manager = ConnectionManager::new(ctx, self.shutdown.clone());

        let pool = manager.clone();
        let active: ActiveConnections = Arc::new(move || pool.active_connections());
        let monitor =
            MonitoringService::new(collector.clone(), active, self.config.snapshot_interval);
        tokio::spawn(monitor.run(self.shutdown.clone()));

        if let Some(api_port) = self.config.api_port {
            let state = ApiState {
                bank_code: self.bank_code,
                port,
                collector,
                manager: manager.clone(),
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = api::serve(api_port, state).await {
                    log::error!("Status API error: {}", e);
                }
            });
        }

        log::info!(
            "Bank {} started on port {} ({} storage)",
            self.bank_code,
            port,
            self.ledger.strategy_name()
        );
        manager.run(server).await;
        log::info!("Bank {} shut down", self.bank_code);
    }

    /// Stop the node
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::LineCodec;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    async fn next_line(client: &mut Framed<TcpStream, LineCodec>) -> String {
        tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no line")
            .expect("closed")
            .unwrap()
    }

    #[tokio::test]
    async fn test_node_serves_and_shuts_down() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            port: Some(1),
            bank_code: Some(Ipv4Addr::new(10, 9, 8, 7)),
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let node = Arc::new(BankNode::new(config).unwrap());
        assert_eq!(node.bank_code(), Ipv4Addr::new(10, 9, 8, 7));

        let server = Server::bind(0).await.unwrap();
        let port = server.port();
        let serving = {
            let node = node.clone();
            tokio::spawn(async move { node.serve(server).await })
        };

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut client = Framed::new(stream, LineCodec::new());
        assert_eq!(next_line(&mut client).await, "BC");
        client.send("AC".to_string()).await.unwrap();
        assert_eq!(next_line(&mut client).await, "AC 10001/10.9.8.7");
        assert!(temp_dir.path().join("accounts.csv").exists());

        node.shutdown();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_memory_storage() {
        let config = NodeConfig {
            storage: StorageKind::Memory,
            bank_code: Some(Ipv4Addr::LOCALHOST),
            ..Default::default()
        };
        let ledger = open_ledger(&config).unwrap();
        assert_eq!(ledger.strategy_name(), "MEMORY");
    }
}
