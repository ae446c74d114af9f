//! CLI commands for the bank node
//!
//! Implements the command handlers for the CLI interface.

use crate::config::NodeConfig;
use crate::network::codec::LineCodec;
use crate::network::message::{Request, Response};
use crate::network::node::BankNode;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Run a bank node until Ctrl+C or an API shutdown
pub async fn cmd_start(config: NodeConfig) -> CliResult<()> {
    let node = BankNode::new(config)?;
    let server = node.bind().await?;

    println!("🏦 Bank {} listening on port {}", node.bank_code(), server.port());

    // Handle Ctrl+C
    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n📴 Shutting down node...");
        }
        shutdown.cancel();
    });

    node.serve(server).await;
    Ok(())
}

/// Send request lines to a bank and collect every reply
///
/// The peer's handshake BC is answered with `bank_code` and not collected.
/// Collection stops once the peer has been quiet for `quiet`.
pub async fn exchange(
    peer: &str,
    lines: &[String],
    bank_code: Ipv4Addr,
    quiet: Duration,
) -> CliResult<Vec<String>> {
    let stream = TcpStream::connect(peer).await?;
    let mut framed = Framed::new(stream, LineCodec::new());

    for line in lines {
        framed.send(line.trim().to_string()).await?;
    }

    let mut replies = Vec::new();
    while let Ok(next) = tokio::time::timeout(quiet, framed.next()).await {
        let Some(line) = next else {
            break;
        };
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if matches!(Request::decode(&line), Ok(Request::BankCode)) {
            framed
                .send(Response::BankCode { ip: bank_code }.encode())
                .await?;
            continue;
        }
        replies.push(line);
    }
    Ok(replies)
}

/// Send request lines to a bank and print its replies
pub async fn cmd_send(
    peer: &str,
    lines: &[String],
    bank_code: Ipv4Addr,
    quiet: Duration,
) -> CliResult<()> {
    let replies = exchange(peer, lines, bank_code, quiet).await?;
    if replies.is_empty() {
        println!("⚠️  No reply from {}", peer);
    }
    for reply in replies {
        println!("{}", reply);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageKind;
    use crate::network::server::Server;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exchange_with_node() {
        let config = NodeConfig {
            bank_code: Some(Ipv4Addr::new(10, 0, 0, 42)),
            storage: StorageKind::Memory,
            ..Default::default()
        };
        let node = Arc::new(BankNode::new(config).unwrap());
        let server = Server::bind(0).await.unwrap();
        let port = server.port();
        let serving = {
            let node = node.clone();
            tokio::spawn(async move { node.serve(server).await })
        };

        let lines = vec!["AC".to_string(), "BN".to_string(), "XX".to_string()];
        let replies = exchange(
            &format!("127.0.0.1:{}", port),
            &lines,
            Ipv4Addr::LOCALHOST,
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        assert_eq!(
            replies,
            vec![
                "AC 10001/10.0.0.42".to_string(),
                "BN 1".to_string(),
                "ER Unknown message kind: XX".to_string(),
            ]
        );

        node.shutdown();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = exchange(
            &addr.to_string(),
            &["BC".to_string()],
            Ipv4Addr::LOCALHOST,
            Duration::from_millis(100),
        )
        .await;
        assert!(result.is_err());
    }
}
