//! Bank networking module
//!
//! Line protocol, per-connection state machine and relaying of requests
//! between banks.
//!
//! # Features
//! - Newline-terminated ASCII protocol over TCP
//! - Request/response matching without request ids
//! - Transparent relaying to the bank that owns an account
//! - Bank discovery by port scan

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod handler;
pub mod manager;
pub mod message;
pub mod node;
pub mod outstanding;
pub mod segment;
pub mod server;

pub use codec::{LineCodec, MAX_LINE_LENGTH};
pub use connection::{
    Connection, ConnectionContext, ConnectionError, ConnectionEvent, ConnectionInfo,
    ConnectionState, Direction,
};
pub use discovery::PortScanner;
pub use handler::{HandlerError, Outcome, RequestHandler};
pub use manager::ConnectionManager;
pub use message::{MessageKind, ProtocolError, Request, Response};
pub use node::{open_ledger, BankNode, NodeError};
pub use outstanding::{Classified, Outstanding, ProxyRegistration};
pub use segment::AccountRef;
pub use server::{Server, DISCOVERY_PORTS, MAX_PORT, MIN_PORT};
