//! mock-llama-server - stand-in for llama.cpp's server in process-level tests
//!
//! Accepts the launch flags the pool passes to a real server so that the
//! exact command line the harness builds can be exercised end to end.

use anyhow::{Context, Result};
use bench_dev::{MockBehavior, MockServer};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mock-llama-server")]
#[command(about = "Mock llama.cpp inference server for benchmarks and tests")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    /// Model file, checked for existence only
    #[arg(long, short = 'm')]
    model: Option<PathBuf>,

    #[arg(long, short = 'c', default_value = "4096")]
    ctx_size: u32,

    #[arg(long, short = 'n', default_value = "1")]
    parallel: u32,

    #[arg(long, short = 'b')]
    batch_size: Option<u32>,

    #[arg(long)]
    ubatch: Option<u32>,

    /// Report "Loading model" for this long after start
    #[arg(long, default_value = "0")]
    load_delay_ms: u64,

    /// Tokens per completion, defaults to the requested n_predict
    #[arg(long)]
    tokens: Option<u64>,

    /// Delay before each completion response
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "mock_llama_server={},bench_dev={}",
            cli.log_level, cli.log_level
        ))
        .with_target(false)
        .init();

    if let Some(model) = &cli.model {
        anyhow::ensure!(model.exists(), "model file {} not found", model.display());
    }

    let mut behavior = MockBehavior::default()
        .with_latency(Duration::from_millis(cli.latency_ms))
        .with_loading_for(Duration::from_millis(cli.load_delay_ms));
    behavior.tokens = cli.tokens;

    let server = MockServer::start_on(&cli.host, cli.port, behavior)
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;

    info!(
        addr = %server.addr(),
        ctx_size = cli.ctx_size,
        parallel = cli.parallel,
        batch_size = ?cli.batch_size,
        ubatch = ?cli.ubatch,
        "mock server listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    server.shutdown().await;
    Ok(())
}
