//! TCP listener for incoming bank connections

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use tokio::net::{TcpListener, TcpStream};

/// Lowest port a bank node listens on
pub const MIN_PORT: u16 = 65525;

/// Highest port a bank node listens on
pub const MAX_PORT: u16 = 65535;

/// Ports scanned when looking for a bank
pub const DISCOVERY_PORTS: RangeInclusive<u16> = MIN_PORT..=MAX_PORT;

/// Whether `port` is in the range bank nodes use
pub fn in_bank_range(port: u16) -> bool {
    DISCOVERY_PORTS.contains(&port)
}

/// TCP server accepting bank connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port on all interfaces
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Bind to the first free port in `range`
    pub async fn bind_in_range(range: RangeInclusive<u16>) -> Result<Self, std::io::Error> {
        let mut last_error = None;
        for port in range.clone() {
            match Self::bind(port).await {
                Ok(server) => return Ok(server),
                Err(e) => {
                    log::debug!("Port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("No port available in {:?}", range),
            )
        }))
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}
