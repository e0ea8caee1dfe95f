//! Overlink agent binary
//!
//! ```bash
//! overlink-agent --config /etc/overlink/agent.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use overlink_agent::{AgentConfig, AgentRuntime, IpRouteInstaller};
use overlink_transport_quic::{QuicConfig, QuicConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Overlink agent: overlay client or gateway
#[derive(Parser, Debug)]
#[command(name = "overlink-agent", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long, env = "OVERLINK_AGENT_CONFIG")]
    config: PathBuf,
}

fn init_tracing(config: &overlink_agent::config::LogConfig) -> Result<()> {
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

#[cfg(target_os = "linux")]
fn interface_provider() -> overlink_agent::tun_linux::TunProvider {
    overlink_agent::tun_linux::TunProvider
}

#[cfg(not(target_os = "linux"))]
compile_error!("the overlink-agent binary currently supports Linux hosts only");

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    init_tracing(&config.log)?;

    // quinn resolves its TLS backend through the process-wide provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    if config.insecure_skip_verify {
        warn!("TLS certificate verification is DISABLED; debug use only");
    }

    let quic_config = if config.insecure_skip_verify {
        Arc::new(QuicConfig::client_insecure())
    } else {
        Arc::new(QuicConfig::client_default())
    };
    let connector = QuicConnector::new(quic_config).context("Failed to create QUIC connector")?;

    let mut runtime = AgentRuntime::new(
        config,
        connector,
        interface_provider(),
        IpRouteInstaller::new(),
    );
    let cancel = runtime.cancel_token();

    info!(agent_id = %runtime.agent_id(), "Overlink agent starting");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            cancel.cancel();
        }
    });

    runtime.run().await.context("Agent failed")?;

    info!("Agent stopped");
    Ok(())
}
