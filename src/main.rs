//! Bank Node CLI Application
//!
//! Runs a bank node, or talks to one.

use bank_node::cli;
use bank_node::config::{NodeConfig, StorageKind};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bank-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A peer-to-peer bank network node", long_about = None)]
struct Cli {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a bank node
    Start {
        /// Port to listen on (default: first free port in 65525-65535)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bank code (default: local IPv4 address)
        #[arg(short, long)]
        bank_code: Option<Ipv4Addr>,

        /// Seconds to wait for a line before dropping a peer
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Data directory for the accounts file
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Account storage
        #[arg(short, long, value_enum)]
        storage: Option<StorageKind>,

        /// Port of the HTTP status API
        #[arg(long)]
        api_port: Option<u16>,
    },

    /// Send request lines to a bank and print the replies
    Send {
        /// Bank address as host:port
        #[arg(long)]
        peer: String,

        /// Bank code used to answer the handshake
        #[arg(short, long, default_value = "127.0.0.1")]
        bank_code: Ipv4Addr,

        /// Seconds of silence before giving up on more replies
        #[arg(short, long, default_value = "2")]
        wait: u64,

        /// Request lines, e.g. "AC" or "AB 10001/10.0.0.1"
        #[arg(required = true)]
        lines: Vec<String>,
    },
}

fn init_logger(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref())?;

    // Initialize logger
    init_logger(config.log_file.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Start {
            port,
            bank_code,
            timeout,
            data_dir,
            storage,
            api_port,
        } => {
            if port.is_some() {
                config.port = port;
            }
            if bank_code.is_some() {
                config.bank_code = bank_code;
            }
            if let Some(secs) = timeout {
                config.read_timeout = Duration::from_secs(secs);
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(storage) = storage {
                config.storage = storage;
            }
            if api_port.is_some() {
                config.api_port = api_port;
            }

            rt.block_on(cli::cmd_start(config))?;
        }

        Commands::Send {
            peer,
            bank_code,
            wait,
            lines,
        } => {
            rt.block_on(cli::cmd_send(
                &peer,
                &lines,
                bank_code,
                Duration::from_secs(wait),
            ))?;
        }
    }

    Ok(())
}
