//! llama-sweep - benchmark sweeps over llama.cpp server deployments

use anyhow::{Context, Result};
use bench_core::axes::{parse_int_list, parse_optional_int_list};
use bench_core::{Error, SweepConfig};
use bench_load::{BatchSpec, LoadGenerator, RetryPolicy};
use bench_runtime::ReadinessProber;
use bench_sweep::{
    render_summary, results_path, CsvResultLog, ProcessDeployer, SweepDriver, SweepPlan,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "llama-sweep")]
#[command(about = "Throughput sweeps over llama.cpp server deployments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full sweep described by the configuration
    Run(RunArgs),

    /// Send one batch to an already running server or proxy
    Batch {
        /// Base URL, e.g. http://127.0.0.1:8088
        #[arg(long)]
        url: String,

        /// Tokens per completion
        #[arg(long, default_value = "128")]
        n_predict: u32,

        /// Requests in flight at once
        #[arg(long, default_value = "8")]
        concurrency: usize,

        /// Total requests, defaults to the configured per-cell count
        #[arg(long)]
        requests: Option<usize>,
    },

    /// Wait until a running server is live and can serve completions
    Probe {
        /// Base URL of the server
        #[arg(long)]
        url: String,
    },

    /// Print the effective configuration as YAML
    #[command(name = "show-config")]
    ShowConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Instance counts, e.g. "1,2,4"
    #[arg(long)]
    instances: Option<String>,

    /// Parallel slots per instance
    #[arg(long)]
    parallel: Option<String>,

    /// Batch sizes, "default" leaves the server's own
    #[arg(long)]
    batch: Option<String>,

    /// Micro-batch sizes, "default" leaves the server's own
    #[arg(long)]
    ubatch: Option<String>,

    /// Tokens per completion
    #[arg(long)]
    max_tokens: Option<String>,

    /// Requests in flight
    #[arg(long)]
    concurrency: Option<String>,

    /// Model file passed to every server
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Server executable
    #[arg(long)]
    server_bin: Option<PathBuf>,

    /// Directory the results subdirectory is created in
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Talk to a single server directly instead of through the proxy
    #[arg(long)]
    no_proxy: bool,

    /// Abort on the first failed tier instead of recording zero rows
    #[arg(long)]
    stop_on_error: bool,

    /// Print the plan and exit without launching anything
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut SweepConfig) -> Result<()> {
        if let Some(raw) = &self.instances {
            config.axes.instances = parse_int_list(raw)?;
        }
        if let Some(raw) = &self.parallel {
            config.axes.parallel = parse_int_list(raw)?;
        }
        if let Some(raw) = &self.batch {
            config.axes.batch = parse_optional_int_list(raw)?;
        }
        if let Some(raw) = &self.ubatch {
            config.axes.ubatch = parse_optional_int_list(raw)?;
        }
        if let Some(raw) = &self.max_tokens {
            config.axes.max_tokens = parse_int_list(raw)?;
        }
        if let Some(raw) = &self.concurrency {
            config.axes.concurrency = parse_int_list(raw)?;
        }
        if let Some(model) = &self.model {
            config.server.model_path = Some(model.clone());
        }
        if let Some(binary) = &self.server_bin {
            config.server.binary = Some(binary.clone());
        }
        if let Some(dir) = &self.results_dir {
            config.output.results_dir = dir.clone();
        }
        if self.no_proxy {
            config.proxy.enabled = false;
        }
        if self.stop_on_error {
            config.continue_on_error = false;
        }
        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = &cli.log_level;
                format!(
                    "llama_sweep={level},bench_core={level},bench_runtime={level},bench_load={level},bench_sweep={level}"
                )
                .into()
            }),
        )
        .with_target(false)
        .init();

    let mut config =
        SweepConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config).context("invalid command line overrides")?;
            run_sweep(&config, args.dry_run).await
        }
        Commands::Batch {
            url,
            n_predict,
            concurrency,
            requests,
        } => run_single_batch(&config, &url, n_predict, concurrency, requests).await,
        Commands::Probe { url } => {
            let prober = ReadinessProber::new(config.readiness.clone())?;
            prober.wait_ready(&url, &url, None).await?;
            println!("{} is ready", url);
            Ok(())
        }
        Commands::ShowConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

async fn run_sweep(config: &SweepConfig, dry_run: bool) -> Result<()> {
    let plan = SweepPlan::build(&config.axes, &config.load);
    info!(
        tiers = plan.tiers.len(),
        deployments = plan.deployment_count(),
        cells = plan.total_cells(),
        "Sweep planned"
    );

    if dry_run {
        for tier in &plan.tiers {
            println!("{}", tier.deployment);
            for cell in &tier.cells {
                println!(
                    "  max_tokens={} concurrency={} requests={}",
                    cell.max_tokens, cell.concurrency, cell.total_requests
                );
            }
        }
        return Ok(());
    }

    let search_root = std::env::current_dir().context("cannot read working directory")?;
    let deployer = ProcessDeployer::new(config, &search_root)?;
    let generator =
        LoadGenerator::from_config(&config.load, RetryPolicy::from_config(&config.retry))?;
    let driver = SweepDriver::new(deployer, generator, config);

    let path = results_path(&config.output, chrono::Local::now());
    let mut log = CsvResultLog::create(&path)
        .with_context(|| format!("cannot create result file {}", path.display()))?;

    let outcome = match driver.run_until(&plan, &mut log, shutdown_signal()).await {
        Ok(outcome) => outcome,
        Err(e @ Error::Interrupted(_)) => {
            warn!(rows = log.rows(), path = %path.display(), "Sweep interrupted");
            return Err(e.into());
        }
        Err(e) => {
            error!(rows = log.rows(), path = %path.display(), "Sweep aborted: {}", e);
            return Err(e.into());
        }
    };

    println!("{}", render_summary(&outcome.rows, outcome.best.as_ref()));
    println!("results: {}", path.display());
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot install SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Cannot listen for SIGINT: {}", e);
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
        },
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_single_batch(
    config: &SweepConfig,
    url: &str,
    n_predict: u32,
    concurrency: usize,
    requests: Option<usize>,
) -> Result<()> {
    let generator =
        LoadGenerator::from_config(&config.load, RetryPolicy::from_config(&config.retry))?;
    let spec = BatchSpec {
        prompt: config.load.prompt.clone(),
        n_predict,
        temperature: config.load.temperature,
        concurrency,
        total_requests: requests.unwrap_or_else(|| config.load.total_requests(concurrency)),
    };

    let result = generator.run_batch(url, &spec).await?;
    println!(
        "throughput_tps={:.1} total_tokens={} elapsed_s={:.2} errors={} p50_ms={} p95_ms={} max_ms={}",
        result.throughput_tokens_per_sec,
        result.total_tokens,
        result.elapsed_seconds,
        result.error_count,
        result.latency_p50_ms,
        result.latency_p95_ms,
        result.latency_max_ms
    );
    if let Some(e) = &result.last_error {
        println!("last_error: {}", e);
    }
    Ok(())
}
