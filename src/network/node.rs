//! P2P Node implementation
//!
//! The node is the runtime context: it owns the reactor and the connection
//! manager and wires them together. Nothing here is global; everything the
//! callbacks touch is reached through the node.

use crate::chain::ChainStore;
use crate::network::manager::{ConnectionManager, ManagerError, SHELL_TOKEN};
use crate::network::message::{NETWORK_MAGIC, PROTOCOL_VERSION};
use crate::network::peer::PeerConfig;
use crate::network::reactor::{Event, Handler, Reactor, ReactorError, Token, WatchKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Node startup errors; these are the only process-fatal failures
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),
    #[error("Outbound connections need a listening address first")]
    NotListening,
}

/// P2P Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to listen on, if any
    pub listen: Option<SocketAddr>,
    /// Peers to dial at startup
    pub bootstrap_peers: Vec<SocketAddr>,
    /// Cap on open plus half-open connections
    pub max_peers: usize,
    /// Listen backlog
    pub max_pending: i32,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub poll_timeout_ms: u64,
    pub write_timeout_secs: u64,
    pub network_magic: u32,
    pub protocol_version: i32,
    pub user_agent: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let peer = PeerConfig::default();
        Self {
            listen: None,
            bootstrap_peers: Vec::new(),
            max_peers: 500,
            max_pending: 100,
            connect_timeout_secs: 10,
            ping_interval_secs: 60,
            poll_timeout_ms: 1000,
            write_timeout_secs: peer.write_timeout.as_secs(),
            network_magic: NETWORK_MAGIC,
            protocol_version: PROTOCOL_VERSION,
            user_agent: peer.user_agent,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; absent fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            magic: self.network_magic,
            protocol_version: self.protocol_version,
            user_agent: self.user_agent.clone(),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

/// An extra input source driven by the node's reactor, such as a shell
pub trait Console {
    /// Descriptor to watch for input
    fn fd(&self) -> RawFd;

    /// Input is available
    fn on_input(&mut self, reactor: &mut Reactor, manager: &mut ConnectionManager);
}

/// Routes console input to the console and everything else to the manager
struct Dispatch<'a, C> {
    manager: &'a mut ConnectionManager,
    console: &'a mut C,
}

impl<C: Console> Handler for Dispatch<'_, C> {
    fn invoke(&mut self, reactor: &mut Reactor, token: Token, event: Event) {
        if token == SHELL_TOKEN {
            self.console.on_input(reactor, self.manager);
        } else {
            self.manager.invoke(reactor, token, event);
        }
    }
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    reactor: Reactor,
    manager: ConnectionManager,
}

impl Node {
    /// Create a node over `chain`; nothing is bound until [`Node::start`]
    pub fn new(config: NodeConfig, chain: Box<dyn ChainStore>) -> Self {
        let mut reactor = Reactor::new();
        reactor.set_poll_timeout(Duration::from_millis(config.poll_timeout_ms));
        reactor.set_connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let mut manager = ConnectionManager::new(&config, chain);
        manager.start(&mut reactor);

        Self {
            config,
            reactor,
            manager,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Listen if configured, then dial the bootstrap peers
    pub fn start(&mut self) -> Result<(), NodeError> {
        if let Some(addr) = self.config.listen {
            self.listen(addr)?;
        }
        let peers = self.config.bootstrap_peers.clone();
        for peer in peers {
            self.connect(peer)?;
        }
        Ok(())
    }

    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, NodeError> {
        Ok(self.manager.listen(&mut self.reactor, addr)?)
    }

    /// Dial `addr`; returns whether a new attempt was started
    pub fn connect(&mut self, addr: SocketAddr) -> Result<bool, NodeError> {
        if !self.manager.is_listening() {
            return Err(NodeError::NotListening);
        }
        Ok(self.manager.open(&mut self.reactor, addr))
    }

    /// Run until stopped
    pub fn run(&mut self) {
        log::info!("Node running");
        self.reactor.run(&mut self.manager);
    }

    /// Run with `console` multiplexed on the same reactor
    pub fn run_with_console<C: Console>(&mut self, console: &mut C) -> Result<(), NodeError> {
        self.reactor
            .register_io(SHELL_TOKEN, console.fd(), WatchKind::Read)?;
        log::info!("Node running");

        let mut dispatch = Dispatch {
            manager: &mut self.manager,
            console,
        };
        self.reactor.run(&mut dispatch);
        self.reactor.deregister(SHELL_TOKEN);
        Ok(())
    }

    /// Close every connection and the listener
    pub fn shutdown(&mut self) {
        log::info!("Node shutting down...");
        self.manager.shutdown(&mut self.reactor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.max_peers, 500);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.ping_interval_secs, 60);
        assert_eq!(config.network_magic, 0xd0b4_bef9);
        assert!(config.user_agent.starts_with("/relay-node:"));
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "listen": "127.0.0.1:18333", "bootstrap_peers": ["10.0.0.1:8333"], "max_peers": 12 }}"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, Some("127.0.0.1:18333".parse().unwrap()));
        assert_eq!(config.bootstrap_peers, vec!["10.0.0.1:8333".parse().unwrap()]);
        assert_eq!(config.max_peers, 12);
        assert_eq!(config.ping_interval_secs, 60);
    }

    #[test]
    fn test_load_invalid_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ \"max_peers\": \"many\" }}").unwrap();
        assert!(matches!(NodeConfig::load(file.path()), Err(NodeError::Config(_))));

        let missing = file.path().with_extension("missing");
        assert!(matches!(NodeConfig::load(&missing), Err(NodeError::Io(_))));
    }

    #[test]
    fn test_connect_requires_listen() {
        let config = NodeConfig {
            bootstrap_peers: vec!["127.0.0.1:1".parse().unwrap()],
            ..NodeConfig::default()
        };
        let mut node = Node::new(config, Box::new(MemoryChain::new()));
        assert!(matches!(node.start(), Err(NodeError::NotListening)));
        assert_eq!(node.manager().peer_count(), 0);
    }

    #[test]
    fn test_start_listens_and_dials() {
        let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = NodeConfig {
            listen: Some("127.0.0.1:0".parse().unwrap()),
            bootstrap_peers: vec![target.local_addr().unwrap()],
            ..NodeConfig::default()
        };
        let mut node = Node::new(config, Box::new(MemoryChain::new()));
        node.start().unwrap();

        assert!(node.manager().local_addr().is_some());
        assert_eq!(node.manager().half_open_peers().len(), 1);

        node.shutdown();
        assert_eq!(node.manager().peer_count(), 0);
        assert!(!node.manager().is_listening());
    }
}
