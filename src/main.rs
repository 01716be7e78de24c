use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use bmpd::{pipeline, ConfigOverrides, Server, ServerConfig};

#[derive(Parser, Debug)]
#[clap(name = "bmpd", rename_all = "kebab-case")]
/// BMP collector front-end
struct Args {
    /// Path to bmpd config.toml (defaults are used if not provided)
    config_path: Option<String>,
    /// Address to listen on for BMP connections
    #[clap(short, long)]
    address: Option<IpAddr>,
    /// Port to listen on for BMP connections
    #[clap(short, long)]
    source_port: Option<u16>,
    /// Port of the destination collector (on localhost) for intercept mode
    #[clap(short, long)]
    destination_port: Option<u16>,
    /// Mirror every message to the destination collector
    #[clap(long)]
    intercept: bool,
    /// Publish IPv4 & IPv6 peers on the same topics
    #[clap(long)]
    no_split_af: bool,
    /// Passive router to connect to (E.g. 10.0.0.1:5000)
    #[clap(long)]
    passive_router: Option<String>,
    /// Seconds between forced reconnects to the passive router
    #[clap(long)]
    heartbeat: Option<u64>,
    /// Publish records as JSON lines to this file
    #[clap(long)]
    json: Option<PathBuf>,
    /// Show debug logs (additive for trace logs)
    #[clap(short, parse(from_occurrences))]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let (bmpd_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bmpd"), bmpd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bmpd_level, other_level);

    let overrides = ConfigOverrides {
        listen_address: args.address,
        source_port: args.source_port,
        destination_port: args.destination_port,
        intercept: args.intercept,
        split_af: if args.no_split_af { Some(false) } else { None },
        passive_router: args.passive_router,
        heartbeat: args.heartbeat,
        json_path: args.json,
    };
    let config = ServerConfig::load(args.config_path.as_deref(), overrides)?;
    debug!("Using config: {:?}", config);

    let publisher = pipeline::from_config(&config.publisher)?;
    let mut server = Server::bind(config, publisher).await?;
    server.start();

    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let signal = tokio::task::spawn_blocking(move || signals.forever().next()).await?;
    if let Some(signal) = signal {
        info!("Received signal {}, stopping bmpd...", signal);
    }
    server.stop();
    server.join().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args =
            Args::try_parse_from(&["bmpd", "bmpd.toml", "-s", "5050", "--no-split-af"]).unwrap();
        assert_eq!(args.config_path.as_deref(), Some("bmpd.toml"));
        assert_eq!(args.source_port, Some(5050));
        assert!(args.no_split_af);

        let args = Args::try_parse_from(&["bmpd", "-vv"]).unwrap();
        assert!(!args.no_split_af);
        assert_eq!(args.verbose, 2);
    }
}
