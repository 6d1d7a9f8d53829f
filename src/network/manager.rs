//! Connection admission and lifecycle
//!
//! The manager owns every peer connection, split into two ordered lists:
//! half-open (outbound connect pending) and open. A remote address appears
//! in at most one of them, and together they never exceed `max_peers`.

use crate::chain::ChainStore;
use crate::network::node::NodeConfig;
use crate::network::peer::{
    ConnectionError, PeerConfig, PeerConnection, PeerContext, BLOCK_REQUEST_TIMEOUT,
};
use crate::network::reactor::{Event, Handler, Reactor, ReactorError, Token, WatchKind};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::time::Duration;
use thiserror::Error;

/// Watch token of the listening socket
pub const LISTENER_TOKEN: Token = Token(0);

/// Watch token of the keepalive timer
pub const KEEPALIVE_TOKEN: Token = Token(1);

/// Watch token of the interactive shell's input
pub const SHELL_TOKEN: Token = Token(2);

/// Peer tokens are allocated upwards from here
const FIRST_PEER_TOKEN: usize = 16;

/// Manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("Cannot advertise {0}; listen on a concrete address")]
    UnspecifiedAddress(SocketAddr),
    #[error("Cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

/// Owns all peer connections and the listening socket
pub struct ConnectionManager {
    chain: Box<dyn ChainStore>,
    listener: Option<TcpListener>,
    /// Address we advertise; set once listening
    local: Option<SocketAddr>,
    open: Vec<PeerConnection>,
    half_open: Vec<PeerConnection>,
    max_peers: usize,
    max_pending: i32,
    ping_interval: Duration,
    peer_config: PeerConfig,
    next_token: usize,
}

impl ConnectionManager {
    pub fn new(config: &NodeConfig, chain: Box<dyn ChainStore>) -> Self {
        Self {
            chain,
            listener: None,
            local: None,
            open: Vec::new(),
            half_open: Vec::new(),
            max_peers: config.max_peers,
            max_pending: config.max_pending,
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            peer_config: config.peer_config(),
            next_token: FIRST_PEER_TOKEN,
        }
    }

    /// Register the keepalive timer
    pub fn start(&mut self, reactor: &mut Reactor) {
        reactor.register_timer(KEEPALIVE_TOKEN, self.ping_interval);
    }

    /// Bind the listening socket and advertise its address.
    ///
    /// The bound address is what peers are told and what self-dials are
    /// checked against, so a wildcard IP is refused.
    pub fn listen(&mut self, reactor: &mut Reactor, addr: SocketAddr) -> Result<SocketAddr, ManagerError> {
        if let Some(local) = self.local {
            return Err(ManagerError::AlreadyListening(local));
        }
        if addr.ip().is_unspecified() {
            return Err(ManagerError::UnspecifiedAddress(addr));
        }

        let listener = self
            .bind(addr)
            .map_err(|source| ManagerError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ManagerError::Bind { addr, source })?;
        reactor.register_io(LISTENER_TOKEN, listener.as_raw_fd(), WatchKind::Read)?;

        log::info!("Listening on {}", bound);
        self.listener = Some(listener);
        self.local = Some(bound);
        Ok(bound)
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.max_pending)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn open_peers(&self) -> &[PeerConnection] {
        &self.open
    }

    pub fn half_open_peers(&self) -> &[PeerConnection] {
        &self.half_open
    }

    pub fn peer_count(&self) -> usize {
        self.open.len() + self.half_open.len()
    }

    pub fn chain(&self) -> &dyn ChainStore {
        self.chain.as_ref()
    }

    fn contains(&self, addr: SocketAddr) -> bool {
        self.open.iter().chain(&self.half_open).any(|c| c.addr() == addr)
    }

    fn addr_of(&self, token: Token) -> Option<SocketAddr> {
        self.open
            .iter()
            .chain(&self.half_open)
            .find(|c| c.token() == token)
            .map(|c| c.addr())
    }

    /// Open peers' addresses followed by our own
    fn known_addrs(&self) -> Vec<SocketAddr> {
        self.open.iter().map(|c| c.addr()).chain(self.local).collect()
    }

    fn advertised(&self) -> SocketAddr {
        self.local
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start an outbound connection; returns whether an attempt was started
    pub fn open(&mut self, reactor: &mut Reactor, addr: SocketAddr) -> bool {
        if self.peer_count() >= self.max_peers {
            log::debug!("Not connecting to {}: peer limit {} reached", addr, self.max_peers);
            return false;
        }
        if self.local == Some(addr) {
            log::debug!("Not connecting to our own address {}", addr);
            return false;
        }
        if self.contains(addr) {
            log::debug!("Already connected or connecting to {}", addr);
            return false;
        }

        let token = self.allocate_token();
        let conn = match PeerConnection::connect(token, addr, self.advertised(), self.peer_config.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Cannot connect to {}: {}", addr, e);
                return false;
            }
        };
        if let Err(e) = reactor.register_io(token, conn.raw_fd(), WatchKind::Write) {
            log::warn!("Cannot watch connection to {}: {}", addr, e);
            return false;
        }

        log::info!("Connecting to {}", addr);
        self.half_open.push(conn);
        true
    }

    /// Move a half-open connection whose connect succeeded to the open list
    pub fn on_connected(&mut self, reactor: &mut Reactor, token: Token) {
        let Some(index) = self.half_open.iter().position(|c| c.token() == token) else {
            reactor.deregister(token);
            return;
        };
        let conn = self.half_open.remove(index);
        let addr = conn.addr();

        let conn = match conn.establish() {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Connection to {} unusable: {}", addr, e);
                reactor.deregister(token);
                return;
            }
        };
        if let Err(e) = reactor.register_io(token, conn.raw_fd(), WatchKind::Read) {
            log::warn!("Cannot watch connection to {}: {}", addr, e);
            reactor.deregister(token);
            return;
        }

        log::info!("Connected to {}", addr);
        self.open.push(conn);
        self.start_handshake(reactor, token);
    }

    /// Accept one pending inbound connection
    pub fn accept_incoming(&mut self, reactor: &mut Reactor) {
        let Some(listener) = &self.listener else {
            return;
        };
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                return;
            }
        };

        if self.peer_count() >= self.max_peers {
            log::info!("Refusing {}: peer limit {} reached", addr, self.max_peers);
            return;
        }

        let token = self.allocate_token();
        let conn = match PeerConnection::accepted(token, stream, addr, self.advertised(), self.peer_config.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Cannot set up connection from {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = reactor.register_io(token, conn.raw_fd(), WatchKind::Read) {
            log::warn!("Cannot watch connection from {}: {}", addr, e);
            return;
        }

        log::info!("Accepted connection from {}", addr);
        self.open.push(conn);
        self.start_handshake(reactor, token);
    }

    fn start_handshake(&mut self, reactor: &mut Reactor, token: Token) {
        let height = self.chain.best_height();
        let Some(conn) = self.open.iter_mut().find(|c| c.token() == token) else {
            return;
        };
        if let Err(e) = conn.send_version(height) {
            log::warn!("Cannot send version to {}: {}", conn.addr(), e);
            self.close(reactor, token);
        }
    }

    /// Remove a connection from whichever list holds it; returns whether one existed
    pub fn close(&mut self, reactor: &mut Reactor, token: Token) -> bool {
        let conn = if let Some(index) = self.open.iter().position(|c| c.token() == token) {
            Some(self.open.remove(index))
        } else {
            self.half_open
                .iter()
                .position(|c| c.token() == token)
                .map(|index| self.half_open.remove(index))
        };

        // Deregister before the socket is dropped
        reactor.deregister(token);
        match conn {
            Some(conn) => {
                log::info!("Closed connection to {}", conn.addr());
                true
            }
            None => false,
        }
    }

    /// Close every connection and the listener
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        let tokens: Vec<Token> = self
            .open
            .iter()
            .chain(&self.half_open)
            .map(|c| c.token())
            .collect();
        for token in tokens {
            self.close(reactor, token);
        }
        reactor.deregister(LISTENER_TOKEN);
        self.listener = None;
    }

    fn on_readable(&mut self, reactor: &mut Reactor, token: Token) {
        let Some(index) = self.open.iter().position(|c| c.token() == token) else {
            reactor.deregister(token);
            return;
        };

        let known = self.known_addrs();
        let mut ctx = PeerContext::new(self.chain.as_mut(), &known);
        ctx.now = reactor.now();
        let result = self.open[index].on_readable(&mut ctx);
        let discovered = ctx.discovered;

        if let Err(e) = result {
            let addr = self.open[index].addr();
            match e {
                ConnectionError::PeerClosed => log::info!("Peer {} closed the connection", addr),
                e => log::warn!("Dropping {}: {}", addr, e),
            }
            self.close(reactor, token);
        }

        for addr in discovered {
            self.open(reactor, addr);
        }
    }

    /// Give up on stale block requests, then ping every open connection.
    ///
    /// The pong drives the next getblocks once a peer has nothing in flight.
    fn keepalive(&mut self, reactor: &mut Reactor) {
        let now = reactor.now();
        let mut failed = Vec::new();
        for conn in &mut self.open {
            conn.expire_requests(now, BLOCK_REQUEST_TIMEOUT);
            if let Err(e) = conn.ping() {
                log::warn!("Ping to {} failed: {}", conn.addr(), e);
                failed.push(conn.token());
            }
        }
        for token in failed {
            self.close(reactor, token);
        }
    }
}

impl Handler for ConnectionManager {
    fn invoke(&mut self, reactor: &mut Reactor, token: Token, event: Event) {
        match (token, event) {
            (LISTENER_TOKEN, Event::Readable) => self.accept_incoming(reactor),
            (KEEPALIVE_TOKEN, Event::Tick) => self.keepalive(reactor),
            (token, Event::Readable) => self.on_readable(reactor, token),
            (token, Event::Connected) => self.on_connected(reactor, token),
            (token, Event::ConnectFailed(e)) => {
                if let Some(addr) = self.addr_of(token) {
                    log::info!("Connection to {} failed: {}", addr, e);
                }
                self.close(reactor, token);
            }
            (token, Event::ConnectTimedOut) => {
                if let Some(addr) = self.addr_of(token) {
                    log::info!("Connection to {} timed out", addr);
                }
                self.close(reactor, token);
            }
            (token, Event::Tick) => log::debug!("Unexpected timer {:?}", token),
        }
    }
}
