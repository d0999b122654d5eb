//! Gateway Daemon
//!
//! Background process that drains the escalation queue into the cloud.
//! Request-serving processes only ever append to the queue; exactly one
//! daemon per queue directory consumes it.
//!
//! # Usage
//!
//! ```bash
//! # Drain with the default config ($XDG_CONFIG_HOME/edge-gateway/gateway.toml)
//! gateway-daemon run
//!
//! # Custom config, verbose logging
//! RUST_LOG=debug gateway-daemon --config /etc/edge-gateway/gateway.toml run
//!
//! # Print queue, dropped and failed totals as JSON
//! gateway-daemon status --pretty
//! ```
//!
//! # Environment Variables
//!
//! - `EDGE_GATEWAY_CONFIG`: Config file path
//! - `EDGE_GATEWAY_*`: Config overrides (see `GatewayConfig::apply_overrides`)
//! - `GROUNDLIGHT_API_TOKEN`: Cloud API token (name configurable)
//! - `RUST_LOG`: Log filter
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Stop after the in-flight entry; an interrupted entry is
//!   redelivered on the next start

mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gateway_core::{load_config, ConsumerConfig, EscalationConsumer, HttpCloudClient};

/// Gateway Daemon - escalation queue drain for the edge gateway
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "EDGE_GATEWAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "EDGE_GATEWAY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain the escalation queue until interrupted (default)
    Run,
    /// Print queue and failure totals as JSON
    Status {
        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("gateway_daemon={level}").parse()?)
            .add_directive(format!("gateway_core={level}").parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn run(consumer_config: ConsumerConfig, cloud: HttpCloudClient) -> Result<()> {
    info!(
        queue = ?consumer_config.queue_dir,
        dedup = ?consumer_config.dedup_dir,
        "Starting escalation drain"
    );
    let mut consumer = EscalationConsumer::new(consumer_config, Arc::new(cloud))
        .context("Failed to open escalation queue")?;
    consumer.run(shutdown_signal()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let consumer_config = ConsumerConfig::from_gateway(&config);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            if config.cloud.api_token().is_none() {
                info!(
                    env = %config.cloud.api_token_env,
                    "No API token set, submitting without one"
                );
            }
            let cloud =
                HttpCloudClient::from_config(&config.cloud).context("Failed to build HTTP client")?;
            run(consumer_config, cloud).await
        }
        Command::Status { pretty } => {
            let report = status::collect(&consumer_config)?;
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
            Ok(())
        }
    }
}
