use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tagfs::config::NodeConfig;
use tagfs::node::Node;
use tagfs::telemetry::{LogFormat, init_tracing};

/// One member of a tagfs cluster.
#[derive(Parser, Debug)]
#[command(name = "tagfs-node", version, about)]
struct Args {
    /// Gossip (UDP) address, e.g. 127.0.0.1:5000.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// HTTP address; defaults to the gossip port + 1000.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML file with the full configuration; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// "human" or "json".
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_path(path)?,
        None => NodeConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if args.http.is_some() {
        config.http = args.http;
    }
    if !args.seeds.is_empty() {
        config.seeds = args.seeds;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let configured_format = config
        .log_format
        .as_deref()
        .map(str::parse::<LogFormat>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    init_tracing(args.log_format.or(configured_format).unwrap_or(LogFormat::Human));

    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    let node = Node::start(config).await?;
    tracing::info!("Node ID: {}", node.id);
    tracing::info!("HTTP server listening on {}", node.http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    node.shutdown().await;

    Ok(())
}
