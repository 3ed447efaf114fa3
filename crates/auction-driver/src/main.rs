//! Auction scenario driver
//!
//! Starts the auction server, launches bidders and replays timed commands
//! from a scenario file. Output of every process is captured under `logs/`.
//!
//! Usage:
//!   auction-driver <scenario>
//!   auction-driver --config driver.json tests/case1.txt
//!   RUST_LOG=debug auction-driver case1.txt

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use auction_driver::{Dispatcher, DriverConfig, Scenario};

/// Auction Scenario Driver
#[derive(Parser, Debug)]
#[command(name = "auction-driver")]
#[command(about = "Replay a timed auction scenario against real server and bidder processes")]
struct Args {
    /// Scenario file: port table, separator line, timed events
    scenario: PathBuf,

    /// JSON driver configuration (server/client commands, readiness, timeouts)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for captured process output (must exist)
    #[arg(short, long, env = "AUCTION_LOGS_DIR")]
    logs_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match args.config {
        Some(ref path) => DriverConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(logs_dir) = args.logs_dir {
        config.logs_dir = logs_dir;
    }

    // Parse everything before any process is started
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("Failed to load scenario {}", args.scenario.display()))?;

    tracing::info!(
        scenario = %args.scenario.display(),
        participants = scenario.ports.len(),
        events = scenario.events.len(),
        launched = ?scenario.launched_participants(),
        "Loaded scenario"
    );

    let mut dispatcher = Dispatcher::new(config);
    let summary = dispatcher
        .run(&scenario)
        .await
        .context("Scenario run failed")?;

    let timed_out = summary.timed_out();
    if !timed_out.is_empty() {
        anyhow::bail!("Clients killed after exit timeout: {}", timed_out.join(", "));
    }

    tracing::info!(
        events = summary.dispatched.len(),
        clients = summary.exits.len(),
        "Scenario completed"
    );

    Ok(())
}
