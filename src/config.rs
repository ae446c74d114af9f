//! Node configuration
//!
//! Values are layered: built-in defaults, then an optional JSON settings
//! file, then command line flags.

use crate::network::server::in_bank_range;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid port: {0}")]
    InvalidPort(u16),
}

/// Where accounts are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Csv,
    Memory,
}

/// Contents of a JSON settings file; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub port: Option<u16>,
    pub bank_code: Option<Ipv4Addr>,
    pub read_timeout_secs: Option<u64>,
    pub dial_timeout_ms: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub storage: Option<StorageKind>,
    pub api_port: Option<u16>,
    pub snapshot_interval_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Bank node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Port to listen on; the first free bank port when unset
    pub port: Option<u16>,
    /// Bank code; the local IPv4 address when unset
    pub bank_code: Option<Ipv4Addr>,
    pub read_timeout: Duration,
    /// Per-port timeout while looking for a bank
    pub dial_timeout: Duration,
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    /// Port of the HTTP status server; disabled when unset
    pub api_port: Option<u16>,
    pub snapshot_interval: Duration,
    pub log_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: None,
            bank_code: None,
            read_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_millis(500),
            data_dir: PathBuf::from("data"),
            storage: StorageKind::Csv,
            api_port: None,
            snapshot_interval: Duration::from_secs(10),
            log_file: None,
        }
    }
}

impl NodeConfig {
    /// Overlay the values present in `settings`
    pub fn apply(&mut self, settings: Settings) {
        if settings.port.is_some() {
            self.port = settings.port;
        }
        if settings.bank_code.is_some() {
            self.bank_code = settings.bank_code;
        }
        if let Some(secs) = settings.read_timeout_secs {
            self.read_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = settings.dial_timeout_ms {
            self.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = settings.data_dir {
            self.data_dir = dir;
        }
        if let Some(storage) = settings.storage {
            self.storage = storage;
        }
        if settings.api_port.is_some() {
            self.api_port = settings.api_port;
        }
        if let Some(secs) = settings.snapshot_interval_secs {
            self.snapshot_interval = Duration::from_secs(secs);
        }
        if settings.log_file.is_some() {
            self.log_file = settings.log_file;
        }
    }

    /// Defaults overlaid with an optional settings file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply(Settings::load(path)?);
        }
        Ok(config)
    }

    /// Reject unusable values; unusual ones only warn
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(port) = self.port {
            if port == 0 {
                return Err(ConfigError::InvalidPort(port));
            }
            if !in_bank_range(port) {
                log::warn!(
                    "Port {} is outside the bank range; other banks will not find this node",
                    port
                );
            }
        }
        if let (Some(api), Some(port)) = (self.api_port, self.port) {
            if api == port {
                return Err(ConfigError::InvalidPort(api));
            }
        }
        Ok(())
    }

    /// The configured bank code, or the detected local address
    pub fn resolve_bank_code(&self) -> Ipv4Addr {
        self.bank_code.unwrap_or_else(|| {
            let ip = detect_local_ip().unwrap_or(Ipv4Addr::LOCALHOST);
            log::info!("Using detected bank code {}", ip);
            ip
        })
    }
}

/// Get local IP address by connecting to a reserved address
pub fn detect_local_ip() -> Option<Ipv4Addr> {
    // Connecting a UDP socket sends nothing; it only selects the route
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("240.0.0.1:1").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
