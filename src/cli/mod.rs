//! Command line interface

pub mod commands;

pub use commands::{cmd_send, cmd_start, exchange, CliResult};
