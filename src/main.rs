//! infer-mux - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infer_mux::{ServingConfig, WorkerPool, api, metrics, pool, shutdown, worker};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "infer-mux")]
#[command(about = "HTTP inference router over device-pinned workers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Override HTTP port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one worker over stdin/stdout; started by the pool
    Worker {
        #[arg(long)]
        model: String,

        #[arg(long)]
        index: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_worker = matches!(cli.command, Some(Command::Worker { .. }));

    // Worker stdout carries frames, so its logs go to stderr
    match (cli.log_format.as_str(), is_worker) {
        ("pretty", false) => tracing_subscriber::fmt()
            .with_env_filter(&cli.log_level)
            .init(),
        ("pretty", true) => tracing_subscriber::fmt()
            .with_env_filter(&cli.log_level)
            .with_writer(std::io::stderr)
            .init(),
        (_, false) => tracing_subscriber::fmt()
            .with_env_filter(&cli.log_level)
            .json()
            .init(),
        (_, true) => tracing_subscriber::fmt()
            .with_env_filter(&cli.log_level)
            .with_writer(std::io::stderr)
            .json()
            .init(),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Some(Command::Worker { ref model, index }) => {
            let outcome = runtime.block_on(run_worker(&cli, model, index));
            // The stdin reader thread cannot be interrupted; do not wait for it
            runtime.shutdown_background();
            outcome
        }
        Some(Command::Serve { port }) => runtime.block_on(serve(&cli, port)),
        None => runtime.block_on(serve(&cli, None)),
    }
}

async fn run_worker(cli: &Cli, model: &str, index: usize) -> Result<()> {
    let config = ServingConfig::load(cli.config.as_ref())?;
    tracing::info!(model = %model, index, pid = std::process::id(), "Starting worker");
    worker::run_stdio(&config, model, index).await
}

async fn serve(cli: &Cli, port: Option<u16>) -> Result<()> {
    tracing::info!("Starting infer-mux");

    // Load configuration
    let mut config = ServingConfig::load(cli.config.as_ref())?;

    // CLI overrides
    if let Some(port) = port {
        config.http_port = port;
    }

    config.validate()?;

    tracing::info!(
        http_port = config.http_port,
        transport = ?config.transport,
        queue_size = config.queue_size,
        models = ?config.enabled_models().map(|(name, _)| name).collect::<Vec<_>>(),
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Start workers
    let spawner = pool::spawner_for(&config, cli.config.as_deref(), &cli.log_level)?;
    let pool = WorkerPool::start(&config, spawner).await?;

    // Setup API
    let app_state = api::AppState {
        router: pool.router(),
        prometheus_handle,
    };
    let app = api::create_router(app_state);

    let addr = format!("{}:{}", config.http_host, config.http_port);
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;

    // Waiting requests are cancelled as soon as the signal arrives
    let coordinator = pool.coordinator().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown::wait_for_signal().await;
            coordinator.trigger();
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutting down...");
    pool.shutdown().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}
