//! Bank Node: a peer-to-peer bank network node in Rust
//!
//! Each node owns the accounts of one bank, identified by an IPv4 "bank
//! code", and speaks a line-oriented protocol over TCP with other nodes:
//! - Two-letter message kinds (`BC`, `BA`, `BN`, `AC`, `AD`, `AW`, `AB`, `AR`, `RP`, `ER`)
//! - Request/response matching without request ids
//! - Transparent relaying of account operations to the owning bank
//! - Bank discovery by scanning ports 65525-65535
//! - In-memory or CSV account storage
//! - Metrics snapshots and an HTTP status API
//!
//! # Example
//!
//! ```rust
//! use bank_node::network::{MessageKind, Request};
//!
//! let request = Request::decode("AB 10001/10.0.0.1").unwrap();
//! assert_eq!(request.kind(), MessageKind::AccountBalance);
//! assert_eq!(request.encode(), "AB 10001/10.0.0.1");
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod network;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use config::{NodeConfig, StorageKind};
pub use ledger::{CsvLedger, Ledger, LedgerError, MemoryLedger};
pub use metrics::{MetricsCollector, MetricsSink, MonitoringService};
pub use network::{BankNode, Connection, ConnectionManager, MessageKind, Request, Response};
