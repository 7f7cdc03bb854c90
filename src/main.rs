//! kvetch - persistent ordered key-value store server.
//!
//! Loads settings, opens the datastore and runs the API server, the
//! metrics server and the reclamation scheduler until a shutdown signal
//! arrives or one of them fails.
//!
//! See `kvetch --help` for usage information.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{Level, error, info};

use kvetch::config::Settings;
use kvetch::logging::init_logging;
use kvetch::reclaim::ReclamationScheduler;
use kvetch::service::ApiService;
use kvetch::{metrics, server, store};

const AFTER_HELP: &str = "\
ENVIRONMENT:
  KVETCH_DATASTORE                  Database file (required unless KVETCH_IN_MEMORY=true)
  KVETCH_IN_MEMORY                  Keep everything in memory
  KVETCH_LISTEN_ADDR                API listener (default 0.0.0.0:7777)
  KVETCH_METRICS_ADDR               Prometheus listener (default 0.0.0.0:9090)
  KVETCH_DISCARD_RATIO              Stale share that triggers a segment rewrite
  KVETCH_RECLAMATION_INTERVAL_SECS  Seconds between reclamation runs
  KVETCH_LOG_FORMAT                 pretty | json | compact
  KVETCH_LOG_LEVEL                  trace | debug | info | warn | error

EXAMPLES:
  kvetch --config /etc/kvetch.toml
  KVETCH_IN_MEMORY=true kvetch --verbose";

#[derive(Parser)]
#[command(name = "kvetch")]
#[command(version)]
#[command(about = "Persistent ordered key-value store with live prefix subscriptions")]
#[command(after_help = AFTER_HELP)]
struct Cli {
    /// Settings file (TOML). Environment variables override its values.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Outcome of one background task, tagged with its name.
type TaskOutcome = (&'static str, kvetch::Result<()>);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "kvetch stopped with an error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let mut log_config = settings.logging.to_log_config();
    if cli.verbose {
        log_config = log_config.level(Level::DEBUG);
    }
    init_logging(&log_config);

    let handle = metrics::init_metrics()?;
    let store = store::open(&settings.store).context("Failed to open datastore")?;
    let service = ApiService::new(Arc::clone(&store));

    let listener = TcpListener::bind(settings.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.listen_addr))?;
    let metrics_listener = TcpListener::bind(settings.server.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.metrics_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

    let shutdown = wait_for_shutdown(shutdown_rx.clone());
    let api = service.clone();
    tasks.spawn(async move { ("API server", server::serve(listener, api, shutdown).await) });

    let shutdown = wait_for_shutdown(shutdown_rx.clone());
    tasks.spawn(async move {
        (
            "metrics server",
            server::serve_metrics(metrics_listener, handle, shutdown).await,
        )
    });

    let scheduler = ReclamationScheduler::from_settings(Arc::clone(&store), &settings.store);
    let shutdown = wait_for_shutdown(shutdown_rx);
    tasks.spawn(async move { ("reclamation scheduler", scheduler.run(shutdown).await) });

    info!(
        backend = store.backend_name(),
        listen_addr = %settings.server.listen_addr,
        metrics_addr = %settings.server.metrics_addr,
        "kvetch started"
    );

    let mut failure = tokio::select! {
        () = server::shutdown_signal() => None,
        Some(joined) = tasks.join_next() => Some(match task_result(joined) {
            Ok(name) => anyhow!("{name} exited unexpectedly"),
            Err(e) => e,
        }),
    };
    if let Some(e) = &failure {
        error!(error = %format!("{e:#}"), "Background task failed, shutting down");
    }

    info!("Starting graceful shutdown...");
    let _ = shutdown_tx.send(true);
    service.shutdown();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = task_result(joined) {
            error!(error = %format!("{e:#}"), "Task failed during shutdown");
            failure.get_or_insert(e);
        }
    }

    info!("Graceful shutdown complete");
    failure.map_or(Ok(()), Err)
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

fn task_result(joined: std::result::Result<TaskOutcome, JoinError>) -> Result<&'static str> {
    let (name, result) = joined.context("Background task panicked")?;
    result.with_context(|| format!("{name} failed"))?;
    Ok(name)
}
