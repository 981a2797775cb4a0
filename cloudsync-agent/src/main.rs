//! Cloudsync Agent - Main entry point
//!
//! Continuous backup agent mirroring local directory trees into a remote
//! object store.

use anyhow::{bail, Context, Result};
use clap::Parser;
use cloudsync_agent::{daemon::ShutdownCoordinator, utils, watch::NotifyWatchService, Agent, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Reconcile every backup once, wait for the uploads, then exit
    #[arg(long)]
    once: bool,

    /// Diagnostics API port (overrides config)
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    if let Some(port) = args.api_port {
        config.api.port = port;
    }

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level)?;

    tracing::info!(
        "Starting cloudsync-agent v{} (agent_id: {}, backups: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id,
        config.backups.len()
    );

    let agent = Agent::from_config(config).context("Failed to initialize agent")?;
    let faults = agent.faults();

    if args.once {
        let stats = agent.run_once().await?;
        let reported = faults.recent().len();
        if stats.failed > 0 || reported > 0 {
            bail!(
                "One-shot sync finished with {} failed task(s) and {} fault(s)",
                stats.failed,
                reported
            );
        }
        return Ok(());
    }

    let service = NotifyWatchService::new().context("Failed to open filesystem watch service")?;

    // Create shutdown coordinator
    let coordinator = ShutdownCoordinator::new();
    let signals = coordinator.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    agent
        .run(Box::new(service), coordinator.token())
        .await
        .context("Agent stopped with an error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
