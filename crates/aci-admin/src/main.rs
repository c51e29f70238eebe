//! ACI Admin - operator command line for ACI kernels.
//!
//! Each subcommand runs one operation against the local kernel (or a named
//! node) and prints the outcome as JSON on stdout.

mod commands;

use aci_core::{ClientConfig, NodeAddress, WireProtocol};
use anyhow::{Context, Result};
use clap::Parser;
use commands::Command;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "aci-admin")]
#[command(about = "Activate, invoke and relocate services on ACI kernels")]
struct Args {
    /// JSON client configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local kernel address (host[:port])
    #[arg(short, long)]
    kernel: Option<String>,

    /// Wire framing: line or http
    #[arg(long)]
    protocol: Option<WireProtocol>,

    /// Read timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Requestor id sent with every request (random if unset)
    #[arg(long)]
    requestor: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(kernel) = &self.kernel {
            let address = NodeAddress::parse(kernel)?;
            config = config.with_kernel(address.host, address.port);
        }
        if let Some(protocol) = self.protocol {
            config = config.with_protocol(protocol);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_read_timeout(Some(Duration::from_millis(ms)));
        }
        if let Some(requestor) = &self.requestor {
            config = config.with_requestor_id(requestor.clone());
        }
        Ok(config)
    }
}

/// RUST_LOG directives win over --debug; unparsable directives fall back to the flag.
fn log_filter(directives: Option<&str>, debug: bool) -> EnvFilter {
    let default_level = if debug { "debug" } else { "warn" };
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the JSON result.
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(directives.as_deref(), args.debug))
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = args.client_config()?;
    debug!(
        "Using kernel {} over {}",
        config.kernel_address(),
        config.protocol
    );

    let output = commands::run(&config, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
