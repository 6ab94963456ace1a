// src/bin/foreman.rs
//
// fleetbench-foreman: serves jobs to the manager, one at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use fleet_bench::connection::BackendFactory;
use fleet_bench::foreman::{serve_with_shutdown, ForemanConfig, ForemanService};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "fleetbench-foreman", version, about = "fleetbench load generator (gRPC)")]
struct Cli {
    /// Increase verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listen address, e.g. 0.0.0.0:5150
    #[arg(long, default_value = "0.0.0.0:5150")]
    listen: String,

    /// Workers per target when the job does not say (default: CPU count)
    #[arg(long)]
    workers: Option<u32>,
}

/// Wait for SIGINT or SIGTERM; returns the signal name for logging.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Cli::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("fleetbench_foreman={level},fleet_bench={level}"));
    fmt().with_env_filter(filter).with_target(false).init();
    debug!("Logging initialized at level: {}", level);

    let addr: SocketAddr = args.listen.parse().context("invalid listen addr")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let bound = listener.local_addr().context("reading bound address")?;

    let mut config = ForemanConfig::default();
    if let Some(workers) = args.workers.filter(|w| *w > 0) {
        config.default_workers_per_target = workers;
    }
    let service = ForemanService::new(Arc::new(BackendFactory::default()), config);

    // Scripts wait for this line before pointing a manager here.
    println!("fleetbench-foreman listening on {bound}");

    let signals = wait_for_shutdown_signal();
    serve_with_shutdown(listener, service, async {
        match signals.await {
            Ok(sig) => info!("Received {} - initiating graceful shutdown", sig),
            Err(e) => {
                tracing::error!("{:#}", e);
                std::future::pending::<()>().await
            }
        }
    })
    .await
    .context("foreman server failed")?;
    info!("Foreman shutdown complete");
    Ok(())
}
