//! Bank discovery
//!
//! A bank is located by its IP only; the listening port is found by trying
//! every port in the bank range concurrently. Every port that accepts is kept,
//! since several nodes may share one host.

use crate::network::server::DISCOVERY_PORTS;
use futures::future::join_all;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::net::TcpStream;

/// Port scanner for locating bank nodes
#[derive(Debug, Clone)]
pub struct PortScanner {
    ports: RangeInclusive<u16>,
    dial_timeout: Duration,
}

impl PortScanner {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            ports: DISCOVERY_PORTS,
            dial_timeout,
        }
    }

    /// Scan a custom port range
    pub fn with_ports(ports: RangeInclusive<u16>, dial_timeout: Duration) -> Self {
        Self {
            ports,
            dial_timeout,
        }
    }

    /// Connect to every listening port of `bank`
    pub async fn scan(&self, bank: Ipv4Addr) -> Vec<TcpStream> {
        log::info!("Looking for bank {} on ports {:?}", bank, self.ports);

        let attempts = self.ports.clone().map(|port| {
            let addr = SocketAddr::new(IpAddr::V4(bank), port);
            async move {
                match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        log::trace!("No bank at {}: {}", addr, e);
                        None
                    }
                    Err(_) => {
                        log::trace!("Connecting to {} timed out", addr);
                        None
                    }
                }
            }
        });

        let found: Vec<TcpStream> = join_all(attempts).await.into_iter().flatten().collect();
        log::info!("Found {} listener(s) for bank {}", found.len(), bank);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_scan_finds_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let low = port.saturating_sub(1);

        let scanner = PortScanner::with_ports(low..=port, Duration::from_millis(500));
        let found = scanner.scan(Ipv4Addr::LOCALHOST).await;
        assert!(found
            .iter()
            .any(|s| s.peer_addr().unwrap().port() == port));
    }

    #[tokio::test]
    async fn test_scan_nothing_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let scanner = PortScanner::with_ports(port..=port, Duration::from_millis(200));
        assert!(scanner.scan(Ipv4Addr::LOCALHOST).await.is_empty());
    }
}
