//! Demo cluster node.
//!
//! Starts one membership node, optionally joins a cluster through seed
//! nodes, and prints membership events until interrupted. Useful for poking
//! at a cluster from a couple of terminals:
//!
//! ```text
//! rumor --name a --port 7946
//! rumor --name b --port 7947 --seeds 127.0.0.1:7946
//! ```

use clap::Parser;
use rumor::{ChannelEvents, Config, Event, Keyring, Membership, parse_cidrs};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rumor", version, about = "Gossip membership demo node")]
struct Args {
    /// Unique node name (defaults to the hostname of the bind address)
    #[arg(short, long)]
    name: Option<String>,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Bind port (0 picks an ephemeral port)
    #[arg(short, long, default_value = "7946")]
    port: u16,

    /// Address advertised to peers (defaults to the bind address)
    #[arg(short = 'a', long)]
    advertise: Option<IpAddr>,

    /// Seed nodes, comma-separated (ip:port or name@ip:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Cluster label; traffic with a different label is dropped
    #[arg(short, long, default_value = "")]
    label: String,

    /// Hex-encoded 16/24/32-byte encryption key (may repeat; first is primary)
    #[arg(short, long)]
    key: Vec<String>,

    /// CIDRs allowed to join (may repeat)
    #[arg(long)]
    allow: Vec<String>,

    /// Use WAN-profile timing instead of LAN
    #[arg(long)]
    wan: bool,

    /// Skip the graceful leave on Ctrl-C (peers will detect a failure)
    #[arg(long)]
    abrupt: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let name = args
        .name
        .unwrap_or_else(|| format!("{}:{}", args.bind, args.port));

    let mut config = if args.wan {
        Config::default_wan(&name)
    } else {
        Config::default_lan(&name)
    };
    config.bind_addr = args.bind;
    config.bind_port = args.port;
    config.advertise_addr = args.advertise;
    config.label = args.label;

    if !args.key.is_empty() {
        let mut keys = Vec::with_capacity(args.key.len());
        for k in &args.key {
            keys.push(hex::decode(k)?);
        }
        let primary = keys.remove(0);
        config.keyring = Some(Keyring::new(primary, keys)?);
        info!("gossip encryption enabled");
    }
    if !args.allow.is_empty() {
        config.cidrs_allowed = Some(parse_cidrs(&args.allow)?);
    }

    let (events, mut event_rx) = ChannelEvents::new(256);
    config.events = Some(Arc::new(events));

    let node = Membership::create(config).await?;
    info!("listening as {} on {}", name, node.advertise_addr());

    if let Some(seeds) = args.seeds {
        let seeds: Vec<String> = seeds.split(',').map(|s| s.trim().to_string()).collect();
        match node.join(&seeds).await {
            Ok(n) => info!("joined cluster via {} seed(s)", n),
            Err(e) => warn!("could not join any seed: {}", e),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_rx.recv() => {
                match event {
                    Some(Event::Join(n)) => info!("JOIN   {}", n),
                    Some(Event::Leave(n)) => info!("LEAVE  {}", n),
                    Some(Event::Update(n)) => info!("UPDATE {}", n),
                    None => break,
                }
                info!("cluster size: {}", node.num_members());
            }
        }
    }

    if !args.abrupt {
        info!("leaving cluster");
        if let Err(e) = node.leave(Duration::from_secs(5)).await {
            warn!("graceful leave incomplete: {}", e);
        }
    }
    node.shutdown().await?;
    Ok(())
}
