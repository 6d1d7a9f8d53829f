//! Relay-Node: a single-threaded peer-to-peer node runtime in Rust
//!
//! This crate provides the networking core of a cryptocurrency node:
//! - A readiness and timer reactor driving every socket on one thread
//! - Connection admission with connect timeouts and keepalive pings
//! - The version handshake and checksummed wire framing
//! - Address exchange and locator-based block synchronization
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_node::chain::MemoryChain;
//! use relay_node::network::{Node, NodeConfig};
//!
//! let config = NodeConfig {
//!     listen: Some("127.0.0.1:18333".parse().unwrap()),
//!     ..NodeConfig::default()
//! };
//! let mut node = Node::new(config, Box::new(MemoryChain::new()));
//! node.start().unwrap();
//! node.run();
//! ```

pub mod chain;
pub mod cli;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use chain::{build_locator, filter_unknown, Block, BlockHash, ChainStore, MemoryChain};
pub use network::{ConnectionManager, Node, NodeConfig, NodeError, Reactor};
