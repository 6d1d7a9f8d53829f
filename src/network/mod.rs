//! P2P Networking module
//!
//! A single-threaded, event-driven peer runtime.
//!
//! # Features
//! - Readiness and timer reactor over `poll(2)`
//! - Non-blocking outbound connects with a connect timeout
//! - Version/verack handshake and keepalive pings
//! - Checksummed message framing with resumable reads
//! - Address exchange and locator-driven block sync

pub mod codec;
pub mod manager;
pub mod message;
pub mod node;
pub mod peer;
pub mod reactor;

pub use codec::{FrameError, MessageCodec, RawMessage, HEADER_SIZE};
pub use manager::{ConnectionManager, ManagerError, KEEPALIVE_TOKEN, LISTENER_TOKEN, SHELL_TOKEN};
pub use message::{
    Command, GetBlocksMessage, InvItem, InvType, Message, MessageError, NetAddr, ServiceFlags,
    TimedAddr, VersionMessage, MAX_PAYLOAD_SIZE, NETWORK_MAGIC, PROTOCOL_VERSION,
};
pub use node::{Console, Node, NodeConfig, NodeError};
pub use peer::{ConnectionError, Handshake, HandshakeState, PeerConfig, PeerConnection, PeerContext};
pub use reactor::{
    Clock, Event, Handler, PollSelector, Poller, Reactor, ReactorError, SystemClock, Token,
    WatchKind,
};
