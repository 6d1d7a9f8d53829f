//! Peer connection: one socket and its wire-protocol state machine
//!
//! A connection starts either pending (outbound non-blocking connect) or
//! established (accepted). Once established the socket is blocking with a
//! write timeout; reads happen only when the reactor reports readability and
//! accumulate in a buffer, so partial frames never stall the loop.

use crate::chain::{build_locator, filter_unknown, Block, BlockHash, ChainStore};
use crate::network::codec::{FrameError, MessageCodec};
use crate::network::message::{
    GetBlocksMessage, InvItem, InvType, Message, MessageError, NetAddr, ServiceFlags, TimedAddr,
    VersionMessage, MAX_BLOCKS_PER_INV, NETWORK_MAGIC, PROTOCOL_VERSION,
};
use crate::network::reactor::Token;
use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes pulled from the socket per readable event
const READ_CHUNK: usize = 16 * 1024;

/// A requested block not delivered within this long is given up on
pub const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that end one peer connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Malformed message: {0}")]
    Malformed(#[from] MessageError),
    #[error("Peer closed the connection")]
    PeerClosed,
    #[error("Connection not established")]
    NotConnected,
}

/// Wire settings shared by every connection of a node
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub magic: u32,
    pub protocol_version: i32,
    pub user_agent: String,
    /// Bound on a single blocking send
    pub write_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            magic: NETWORK_MAGIC,
            protocol_version: PROTOCOL_VERSION,
            user_agent: format!("/relay-node:{}/", env!("CARGO_PKG_VERSION")),
            write_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Our version has not been sent yet
    Connecting,
    /// Version sent; waiting for the peer's version and verack
    AwaitingPeerVersion,
    /// Both version and verack received
    Complete,
}

/// Handshake flags
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    version_sent: bool,
    version_received: bool,
    verack_received: bool,
}

impl Handshake {
    pub fn state(&self) -> HandshakeState {
        if self.is_complete() {
            HandshakeState::Complete
        } else if self.version_sent {
            HandshakeState::AwaitingPeerVersion
        } else {
            HandshakeState::Connecting
        }
    }

    pub fn is_complete(&self) -> bool {
        self.version_received && self.verack_received
    }

    pub fn mark_version_sent(&mut self) {
        self.version_sent = true;
    }

    /// Record the peer's version; true if this completed the handshake
    pub fn receive_version(&mut self) -> bool {
        let was_complete = self.is_complete();
        self.version_received = true;
        !was_complete && self.is_complete()
    }

    /// Record the peer's verack; true if this completed the handshake
    pub fn receive_verack(&mut self) -> bool {
        let was_complete = self.is_complete();
        self.verack_received = true;
        !was_complete && self.is_complete()
    }
}

// =============================================================================
// Dispatch context
// =============================================================================

/// What a connection may touch while handling messages
pub struct PeerContext<'a> {
    pub chain: &'a mut dyn ChainStore,
    /// Addresses listed in reply to getaddr: open peers and our own
    pub known_addrs: &'a [SocketAddr],
    /// IPv4 addresses learned from addr messages, for the manager to open
    pub discovered: Vec<SocketAddr>,
    /// Time stamped on block requests
    pub now: Instant,
}

impl<'a> PeerContext<'a> {
    pub fn new(chain: &'a mut dyn ChainStore, known_addrs: &'a [SocketAddr]) -> Self {
        Self {
            chain,
            known_addrs,
            discovered: Vec::new(),
            now: Instant::now(),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Socket state
enum Link {
    /// Non-blocking connect in progress
    Pending(Socket),
    /// Connected, blocking, ready for traffic
    Established(TcpStream),
}

/// A single peer connection
pub struct PeerConnection {
    token: Token,
    addr: SocketAddr,
    /// Our advertised address, sent in version and addr
    local: SocketAddr,
    outbound: bool,
    link: Link,
    config: PeerConfig,
    codec: MessageCodec,
    read_buf: BytesMut,
    handshake: Handshake,
    addr_sent: bool,
    getblocks_sent: bool,
    /// Blocks requested with getdata and not yet received, with request time
    in_flight: HashMap<BlockHash, Instant>,
    ping_nonce: Option<u64>,
    peer_version: Option<VersionMessage>,
}

impl PeerConnection {
    /// Start a non-blocking connect to `addr`
    pub fn connect(
        token: Token,
        addr: SocketAddr,
        local: SocketAddr,
        config: PeerConfig,
    ) -> Result<Self, ConnectionError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(Errno::EINPROGRESS as i32) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self::with_link(token, addr, local, config, Link::Pending(socket), true))
    }

    /// Wrap an accepted, already connected stream
    pub fn accepted(
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
        local: SocketAddr,
        config: PeerConfig,
    ) -> Result<Self, ConnectionError> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        Ok(Self::with_link(token, addr, local, config, Link::Established(stream), false))
    }

    fn with_link(
        token: Token,
        addr: SocketAddr,
        local: SocketAddr,
        config: PeerConfig,
        link: Link,
        outbound: bool,
    ) -> Self {
        Self {
            token,
            addr,
            local,
            outbound,
            link,
            codec: MessageCodec::new(config.magic),
            config,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            handshake: Handshake::default(),
            addr_sent: false,
            getblocks_sent: false,
            in_flight: HashMap::new(),
            ping_nonce: None,
            peer_version: None,
        }
    }

    /// Finish a pending connect: back to blocking mode with a write timeout
    pub fn establish(mut self) -> Result<Self, ConnectionError> {
        self.link = match self.link {
            Link::Pending(socket) => {
                socket.set_nonblocking(false)?;
                socket.set_write_timeout(Some(self.config.write_timeout))?;
                Link::Established(TcpStream::from(socket))
            }
            established => established,
        };
        Ok(self)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_established(&self) -> bool {
        matches!(self.link, Link::Established(_))
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.link {
            Link::Pending(socket) => socket.as_raw_fd(),
            Link::Established(stream) => stream.as_raw_fd(),
        }
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.as_ref()
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Give up on block requests older than `max_age`; returns how many.
    ///
    /// Sync resumes with the next message from the peer.
    pub fn expire_requests(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, requested| now.saturating_duration_since(*requested) <= max_age);
        let expired = before - self.in_flight.len();
        if expired > 0 {
            log::debug!("{} blocks requested from {} timed out", expired, self.addr);
        }
        expired
    }

    // -------------------------------------------------------------------------
    // Send path
    // -------------------------------------------------------------------------

    /// Frame and write one message; a short write ends the connection
    pub fn send(&mut self, msg: Message) -> Result<(), ConnectionError> {
        let Link::Established(stream) = &mut self.link else {
            return Err(ConnectionError::NotConnected);
        };
        log::debug!("Sending {} to {}", msg.command(), self.addr);

        let mut frame = BytesMut::new();
        self.codec.encode(msg, &mut frame)?;
        stream.write_all(&frame)?;
        Ok(())
    }

    /// Open the handshake by sending our version
    pub fn send_version(&mut self, start_height: u32) -> Result<(), ConnectionError> {
        let version = VersionMessage {
            version: self.config.protocol_version,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: chrono::Utc::now().timestamp(),
            receiver: NetAddr::new(self.addr, ServiceFlags::NODE_NETWORK),
            sender: NetAddr::new(self.local, ServiceFlags::NODE_NETWORK),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height: i32::try_from(start_height).unwrap_or(i32::MAX),
        };
        self.send(Message::Version(version))?;
        self.handshake.mark_version_sent();
        Ok(())
    }

    /// Keepalive ping with a fresh nonce
    pub fn ping(&mut self) -> Result<(), ConnectionError> {
        let nonce: u64 = rand::random();
        self.send(Message::Ping(nonce))?;
        self.ping_nonce = Some(nonce);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------

    /// Handle a readable event: one read, then every complete message
    pub fn on_readable(&mut self, ctx: &mut PeerContext<'_>) -> Result<(), ConnectionError> {
        let Link::Established(stream) = &mut self.link else {
            return Err(ConnectionError::NotConnected);
        };

        let mut chunk = [0u8; READ_CHUNK];
        let n = match stream.read(&mut chunk) {
            Ok(0) => return Err(ConnectionError::PeerClosed),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        self.read_buf.extend_from_slice(&chunk[..n]);

        while let Some(raw) = self.codec.decode(&mut self.read_buf)? {
            let msg = raw.into_message()?;
            self.dispatch(msg, ctx)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message, ctx: &mut PeerContext<'_>) -> Result<(), ConnectionError> {
        log::debug!("Received {} from {}", msg.command(), self.addr);

        match msg {
            Message::Version(version) => {
                log::info!(
                    "Peer {} version {} {} height {}",
                    self.addr,
                    version.version,
                    version.user_agent,
                    version.start_height
                );
                self.peer_version = Some(version);
                let completed = self.handshake.receive_version();
                self.send(Message::Verack)?;
                if completed {
                    self.on_handshake_complete(ctx)?;
                }
                return Ok(());
            }
            Message::Verack => {
                if self.handshake.receive_verack() {
                    self.on_handshake_complete(ctx)?;
                }
                return Ok(());
            }
            other if !self.handshake.is_complete() => {
                log::debug!("Ignoring {} from {} before handshake", other.command(), self.addr);
                return Ok(());
            }
            Message::Ping(nonce) => self.send(Message::Pong(Some(nonce)))?,
            Message::Pong(nonce) => {
                if nonce.is_none() || nonce != self.ping_nonce {
                    log::debug!("Pong from {} does not match our last ping", self.addr);
                }
            }
            Message::Inv(items) => self.on_inv(&items, ctx)?,
            Message::Addr(entries) => self.on_addr(&entries, ctx),
            Message::GetAddr => self.send_addr(ctx)?,
            Message::GetBlocks(req) => self.serve_getblocks(&req, ctx)?,
            Message::GetData(items) => self.serve_getdata(&items, ctx)?,
            Message::NotFound(items) => {
                for item in &items {
                    if self.in_flight.remove(&item.hash).is_some() {
                        log::debug!("{} does not have block {}", self.addr, item.hash);
                    }
                }
            }
            Message::Block(payload) => self.on_block(payload, ctx),
            Message::Tx(payload) => ctx.chain.process_transaction(&payload),
            Message::Unknown(name) => {
                log::warn!("Unknown command '{}' from {}", name, self.addr);
            }
        }

        self.continue_sync(ctx)
    }

    fn on_handshake_complete(&mut self, ctx: &mut PeerContext<'_>) -> Result<(), ConnectionError> {
        log::info!("Handshake complete with {}", self.addr);
        self.send(Message::GetAddr)?;
        self.continue_sync(ctx)
    }

    /// Send addr once per session, then getblocks when nothing is outstanding
    fn continue_sync(&mut self, ctx: &mut PeerContext<'_>) -> Result<(), ConnectionError> {
        if !self.handshake.is_complete() {
            return Ok(());
        }
        if !self.addr_sent {
            self.send_addr(ctx)?;
            self.addr_sent = true;
        }
        if !self.getblocks_sent && self.in_flight.is_empty() {
            self.send_getblocks(ctx)?;
        }
        Ok(())
    }

    fn send_addr(&mut self, ctx: &PeerContext<'_>) -> Result<(), ConnectionError> {
        let now = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        let entries = ctx
            .known_addrs
            .iter()
            .map(|addr| TimedAddr {
                timestamp: now,
                addr: NetAddr::new(*addr, ServiceFlags::NODE_NETWORK),
            })
            .collect();
        self.send(Message::Addr(entries))
    }

    fn send_getblocks(&mut self, ctx: &PeerContext<'_>) -> Result<(), ConnectionError> {
        let locator = match build_locator(&*ctx.chain) {
            Ok(locator) => locator,
            Err(e) => {
                log::warn!("Cannot build block locator: {}", e);
                return Ok(());
            }
        };
        self.send(Message::GetBlocks(GetBlocksMessage {
            version: u32::try_from(self.config.protocol_version).unwrap_or(PROTOCOL_VERSION as u32),
            locator,
            stop: BlockHash::ZERO,
        }))?;
        self.getblocks_sent = true;
        Ok(())
    }

    fn on_inv(&mut self, items: &[InvItem], ctx: &PeerContext<'_>) -> Result<(), ConnectionError> {
        let wanted = filter_unknown(&*ctx.chain, items);
        if wanted.is_empty() {
            return Ok(());
        }
        log::debug!("Requesting {} blocks from {}", wanted.len(), self.addr);
        self.in_flight
            .extend(wanted.iter().map(|item| (item.hash, ctx.now)));
        self.send(Message::GetData(wanted))?;
        self.getblocks_sent = false;
        Ok(())
    }

    fn on_addr(&mut self, entries: &[TimedAddr], ctx: &mut PeerContext<'_>) {
        for entry in entries {
            match entry.addr.ipv4_socket_addr() {
                Some(addr) => ctx.discovered.push(addr),
                None => log::debug!("Ignoring non-IPv4 address {} from {}", entry.addr.ip, self.addr),
            }
        }
    }

    fn on_block(&mut self, payload: Bytes, ctx: &mut PeerContext<'_>) {
        let block = match Block::from_bytes(payload.to_vec()) {
            Ok(block) => block,
            Err(e) => {
                log::warn!("Bad block from {}: {}", self.addr, e);
                return;
            }
        };
        let hash = ctx.chain.block_hash(&block);
        self.in_flight.remove(&hash);
        if let Err(e) = ctx.chain.process_block(block) {
            log::warn!("Block {} from {} rejected: {}", hash, self.addr, e);
        }
    }

    /// Announce up to 500 main-branch blocks after the first locator hash we know
    fn serve_getblocks(
        &mut self,
        req: &GetBlocksMessage,
        ctx: &PeerContext<'_>,
    ) -> Result<(), ConnectionError> {
        let chain = &*ctx.chain;
        let branch = chain.main_branch();
        let fork = req
            .locator
            .iter()
            .find_map(|hash| chain.main_index_of(hash))
            .unwrap_or(0);

        let mut items = Vec::new();
        for index in fork + 1..chain.branch_block_count(branch) {
            let block = match chain.load_block(index, branch) {
                Ok(block) => block,
                Err(e) => {
                    log::warn!("Cannot load block {}: {}", index, e);
                    break;
                }
            };
            let hash = chain.block_hash(&block);
            items.push(InvItem::new(InvType::Block, hash));
            if hash == req.stop || items.len() >= MAX_BLOCKS_PER_INV {
                break;
            }
        }

        if items.is_empty() {
            return Ok(());
        }
        self.send(Message::Inv(items))
    }

    fn serve_getdata(&mut self, items: &[InvItem], ctx: &PeerContext<'_>) -> Result<(), ConnectionError> {
        for item in items.iter().filter(|item| item.kind == InvType::Block) {
            match ctx.chain.find_block(&item.hash) {
                Some(block) => self.send(Message::Block(Bytes::copy_from_slice(block.as_bytes())))?,
                None => log::debug!("{} asked for unknown block {}", self.addr, item.hash),
            }
        }
        Ok(())
    }
}
