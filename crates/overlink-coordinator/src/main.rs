//! Overlink coordinator binary
//!
//! ```bash
//! overlink-coordinator --config /etc/overlink/coordinator.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use overlink_coordinator::{Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Overlink coordinator: overlay session router
#[derive(Parser, Debug)]
#[command(name = "overlink-coordinator", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long, env = "OVERLINK_COORDINATOR_CONFIG")]
    config: PathBuf,
}

fn init_tracing(config: &overlink_coordinator::config::LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to build log filter")?;

    let json = config.format == "json";

    if config.file.is_empty() {
        if json {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file)
            .with_context(|| format!("Failed to open log file {}", config.file))?;
        let writer = std::sync::Arc::new(file);
        if json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = CoordinatorConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    init_tracing(&config.log)?;

    // quinn resolves its TLS backend through the process-wide provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    info!("Starting Overlink coordinator");

    let coordinator = Coordinator::new(config)
        .await
        .context("Failed to start coordinator")?;
    let cancel = coordinator.cancel_token();

    let mut run = tokio::spawn(coordinator.run());

    tokio::select! {
        result = &mut run => {
            result.context("Coordinator task failed")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            cancel.cancel();
            run.await.context("Coordinator task failed")??;
        }
    }

    info!("Coordinator stopped");
    Ok(())
}
