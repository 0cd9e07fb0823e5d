//! dirsync-server - replication node
//!
//! Runs the relay and directory server domains named in a TOML
//! configuration until interrupted.

use clap::Parser;
use dirsync_server::{Node, NodeConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dirsync-server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "dirsync-server")]
#[command(about = "Multi-master directory replication node", long_about = None)]
struct Args {
    /// Configuration file (defaults to $DIRSYNC_CONFIG)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "dirsync_core=debug,dirsync_server=debug"
    } else {
        "dirsync_core=info,dirsync_server=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("dirsync-worker")
        .enable_all()
        .build()?;
    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = NodeConfig::load(args.config.as_deref())?;
    let mut node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    node.shutdown();
    Ok(())
}
