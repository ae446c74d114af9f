//! REST API module
//!
//! Read-only HTTP view of a running bank node, plus a shutdown trigger.
//!
//! # Endpoints
//! - `GET /health` - Health check
//! - `GET /api/status` - Bank code, port and the current snapshot
//! - `GET /api/connections` - Live connections
//! - `GET /api/commands` - Per-command metrics
//! - `POST /api/shutdown` - Stop the node

pub mod handlers;
pub mod routes;

pub use handlers::ApiState;
pub use routes::{create_router, serve};
