//! plexusd - the plexus automation daemon.
//!
//! Hosts one or more named services, each supervising its configured
//! driver subprocesses. Staged configuration is read from a JSON file;
//! the staging engine proper is an external collaborator, so this
//! binary wires `StaticConfig` in its place.
//!
//! # Environment
//!
//! - `PLEXUSD_LOG`: tracing filter (e.g. `info`, `plexus_service=debug`)

use anyhow::{Context, Result};
use clap::Parser;
use plexus_service::{Daemon, Service, StaticConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The plexus automation daemon.
#[derive(Parser, Debug)]
#[command(name = "plexusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Staged configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Services to host in this process; the first one is the master
    #[arg(short, long, default_values_t = [String::from("engine")])]
    services: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("PLEXUSD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let staged = std::fs::read(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let staged = serde_json::from_slice(&staged)
        .with_context(|| format!("parsing config {}", args.config.display()))?;
    let config = Arc::new(StaticConfig::new(staged));

    let daemon = Daemon::new();
    info!(daemon = daemon.id(), "starting plexusd");

    for name in &args.services {
        let service = Service::new(&daemon, config.clone(), name);
        service.start();
    }

    wait_for_signal().await?;

    info!("signal received, draining services");
    for service in daemon.services() {
        service.drain().await;
    }
    daemon.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
