use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rs_swarm::codec::hash_from_hex;
use rs_swarm::{ClientConfig, Tracker, generate_peer_id};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Talks to a single BitTorrent tracker and prints what it says.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Tracker announce URL (udp://, http:// or https://).
    #[arg(short, long)]
    tracker: String,

    /// Info hash as 40 hex characters.
    #[arg(short, long)]
    info_hash: String,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce and list the returned peers.
    Announce {
        /// Port reported to the tracker.
        #[arg(short, long, default_value_t = 6881)]
        port: u16,

        /// Bytes left to download.
        #[arg(long, default_value_t = 0)]
        left: u64,

        /// Peers to ask for; negative uses the tracker default.
        #[arg(long, default_value_t = 50, allow_negative_numbers = true)]
        num_want: i32,
    },
    /// Ask for swarm statistics.
    Scrape,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> rs_swarm::Result<()> {
    let info_hash = hash_from_hex(&args.info_hash)?;
    let timeout = Duration::from_secs(args.timeout);
    let mut config = ClientConfig::default();
    config.tracker.udp_receive_timeout = timeout;
    config.tracker.http_timeout = timeout;
    let config = config.tracker;

    match args.command {
        Command::Announce {
            port,
            left,
            num_want,
        } => {
            let tracker = Tracker::new(&args.tracker, info_hash, generate_peer_id(), port, left, config)?;
            tracker.set_num_want(num_want);
            let response = tracker
                .announce_now()
                .await
                .ok_or_else(|| rs_swarm::Error::Tracker("no announce response".into()))?;
            println!(
                "interval {}s, {} seeders, {} leechers, {} peers",
                response.interval,
                response.seeders,
                response.leechers,
                response.peers.len()
            );
            for peer in response.peers {
                println!("{peer}");
            }
        }
        Command::Scrape => {
            let tracker = Tracker::new(&args.tracker, info_hash, generate_peer_id(), 0, 0, config)?;
            let entry = tracker.scrape().await?;
            println!(
                "{} seeders, {} leechers, {} completed",
                entry.seeders, entry.leechers, entry.completed
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
