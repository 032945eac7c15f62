use clap::Parser;
use log::info;
use query::network::{QueryClient, QueryConfig};
use shared::{LiveSnapshot, QueryOutcome, ServerId};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query a game server over A2S", long_about = None)]
struct Args {
    /// Query address of the server
    #[arg(short = 'a', long, default_value = "127.0.0.1:27015")]
    addr: String,

    /// Per-attempt response timeout in milliseconds
    #[arg(short = 't', long, default_value = "1500")]
    timeout_ms: u64,

    /// Retries after the first attempt
    #[arg(short = 'r', long, default_value = "2")]
    retries: u32,
}

/// Renders a snapshot as the lines printed to stdout.
fn describe(snapshot: &LiveSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    match &snapshot.outcome {
        QueryOutcome::Unreachable { attempts, reason } => {
            lines.push(format!(
                "{} unreachable after {} attempts: {}",
                snapshot.server, attempts, reason
            ));
        }
        QueryOutcome::Reachable { info, players } => {
            match info {
                Some(info) => lines.push(format!(
                    "{} [{}] map {} ({}/{} players, {} bots)",
                    info.name, info.game, info.map, info.players, info.max_players, info.bots
                )),
                None => lines.push(format!("{} (no server info)", snapshot.server)),
            }
            for player in players {
                lines.push(format!(
                    "  {:<32} score {:>4}  connected {:>6.0}s",
                    player.name, player.score, player.duration
                ));
            }
        }
    }
    lines
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = QueryConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        max_retries: args.retries,
        ..QueryConfig::default()
    };

    let client = QueryClient::resolve(&args.addr, config).await?;
    info!("Querying {}", client.addr());

    let snapshot = client.snapshot(&ServerId::new(args.addr.clone())).await;
    for line in describe(&snapshot) {
        println!("{}", line);
    }

    if !snapshot.is_reachable() {
        std::process::exit(1);
    }
    Ok(())
}
