//! tmbridge CLI: runs a test-management worker behind a request/response bridge.

mod serve;

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tmbridge_config::CliOverrides;
use tmbridge_core::Bridge;

#[derive(Parser)]
#[command(
    name = "tmbridge",
    version,
    about = "Request/response bridge to a test-management worker process"
)]
struct Cli {
    /// Config file (default: ~/.tmbridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker command (overrides TMBRIDGE_WORKER_COMMAND and the config file)
    #[arg(long)]
    worker: Option<String>,

    /// Argument passed to the worker command; repeat for several
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Send a single JSON request, print the response and exit
    #[arg(long)]
    call: Option<String>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries responses only.
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    let config = tmbridge_config::load(CliOverrides {
        config_path: cli.config,
        worker_command: cli.worker,
        worker_args: (!cli.worker_args.is_empty()).then_some(cli.worker_args),
        call_timeout_ms: cli.timeout_ms,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let bridge = Arc::new(Bridge::start(config).context("Failed to start worker bridge")?);

    let result = match cli.call {
        Some(request) => call_once(&bridge, &request).await,
        None => serve::serve(Arc::clone(&bridge)).await,
    };

    bridge.shutdown().await;
    result
}

/// Single-call mode: print the worker's response, or fail with its kind.
async fn call_once(bridge: &Bridge, request: &str) -> Result<()> {
    let request = serve::parse_request(request).map_err(|e| anyhow::anyhow!("{e}"))?;
    match bridge.call(request).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(response.message())?);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Call failed ({}): {e}", e.kind())),
    }
}
