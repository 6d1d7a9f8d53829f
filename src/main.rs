//! Relay-Node CLI Application
//!
//! Starts a node and, unless `--no-shell` is given, an interactive shell on
//! the same event loop.

use clap::Parser;
use relay_node::chain::MemoryChain;
use relay_node::cli::Shell;
use relay_node::network::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay-node")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded peer-to-peer node runtime", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (ip:port)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peer to connect to at startup (repeatable)
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,

    /// Maximum open plus pending connections
    #[arg(long)]
    max_peers: Option<usize>,

    /// Start with a synthetic chain of this height instead of genesis only
    #[arg(long, default_value = "0")]
    chain_height: u32,

    /// Run without the interactive shell
    #[arg(long)]
    no_shell: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = Some(listen);
    }
    config.bootstrap_peers.extend(cli.connect.iter().copied());
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }

    let chain = MemoryChain::with_height(cli.chain_height);
    let mut node = Node::new(config, Box::new(chain));
    node.start()?;

    if cli.no_shell {
        node.run();
    } else {
        let mut shell = Shell::new();
        shell.greet();
        node.run_with_console(&mut shell)?;
    }

    node.shutdown();
    Ok(())
}
