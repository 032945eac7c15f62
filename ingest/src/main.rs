use clap::Parser;
use ingest::config::{load_targets, IngestConfig};
use ingest::orchestrator::Orchestrator;
use ingest::store::JsonFileStore;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ingest game server logs into player statistics", long_about = None)]
struct Args {
    /// JSON array of {name, logPath, enabled, queryAddr?}
    #[arg(long)]
    targets: PathBuf,

    /// Directory for cursors, tracker checkpoints and stats.json
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// How often log files are checked for new lines
    #[arg(long, default_value = "500")]
    poll_ms: u64,

    /// Minimum spacing between cursor checkpoints
    #[arg(long, default_value = "2000")]
    flush_ms: u64,

    /// Live query cadence per server
    #[arg(long, default_value = "15")]
    query_interval_secs: u64,

    /// Per-attempt query timeout
    #[arg(long, default_value = "1500")]
    query_timeout_ms: u64,

    /// Query retries before a server is reported unreachable
    #[arg(long, default_value = "2")]
    query_retries: u32,
}

impl Args {
    fn config(&self) -> IngestConfig {
        let mut config = IngestConfig {
            poll_interval: Duration::from_millis(self.poll_ms),
            flush_interval: Duration::from_millis(self.flush_ms),
            query_interval: Duration::from_secs(self.query_interval_secs),
            ..IngestConfig::default()
        }
        .with_state_dir(self.state_dir.clone());
        config.query.timeout = Duration::from_millis(self.query_timeout_ms);
        config.query.max_retries = self.query_retries;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.config();
    let targets = load_targets(&args.targets)?;
    info!(
        "Loaded {} targets ({} enabled) from {}",
        targets.len(),
        targets.iter().filter(|t| t.enabled).count(),
        args.targets.display()
    );

    let store = JsonFileStore::open(config.stats_path())?;
    let mut orchestrator = Orchestrator::new(config, store)?;
    if let Err(e) = orchestrator.apply_targets(&targets).await {
        error!("Failed to start servers: {}", e);
        orchestrator.shutdown().await?;
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    let aggregator = orchestrator.shutdown().await?;
    info!("Final totals: {:?}", aggregator.counters());
    Ok(())
}
