//! Network message types for P2P communication
//!
//! Payload layouts follow the Bitcoin wire protocol: little-endian integers,
//! CompactSize counts, and 26-byte network addresses whose 16-byte IP field
//! carries IPv4 addresses in IPv4-mapped IPv6 form.

use crate::chain::BlockHash;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Protocol version
pub const PROTOCOL_VERSION: i32 = 70001;

/// Network magic identifying our network
pub const NETWORK_MAGIC: u32 = 0xd0b4_bef9;

/// Maximum payload size accepted from a peer (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Maximum number of addresses in one addr message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum number of inventory entries in one inv/getdata message
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

/// Maximum number of block hashes announced in reply to getblocks
pub const MAX_BLOCKS_PER_INV: usize = 500;

/// Maximum locator length accepted in a getblocks request
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Ping/pong nonce size in bytes
pub const NONCE_SIZE: usize = 8;

/// Payload decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("Payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Ping nonce size {0}, expected 8")]
    BadNonceLength(usize),
    #[error("Too many entries: {0}")]
    TooManyEntries(u64),
    #[error("User agent is not valid UTF-8")]
    InvalidUserAgent,
}

bitflags! {
    /// Services advertised in version and addr messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        /// Node can serve full blocks
        const NODE_NETWORK = 1;
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Command names carried in the 12-byte header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    Tx,
    Block,
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::NotFound => "notfound",
            Command::GetBlocks => "getblocks",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::Unknown(name) => name.as_str(),
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "notfound" => Command::NotFound,
            "getblocks" => Command::GetBlocks,
            "tx" => Command::Tx,
            "block" => Command::Block,
            other => Command::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Payload types
// =============================================================================

/// Network address as carried in version and addr payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    /// Encoded size without timestamp
    pub const SIZE: usize = 26;

    /// Wrap a socket address; IPv4 addresses are stored IPv4-mapped
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// The IPv4 socket address, if the IP field is IPv4-mapped
    pub fn ipv4_socket_addr(&self) -> Option<SocketAddr> {
        self.ip
            .to_ipv4_mapped()
            .map(|v4| SocketAddr::new(IpAddr::V4(v4), self.port))
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64_le(self.services.bits());
        dst.put_slice(&self.ip.octets());
        // Port is the one big-endian field on the wire
        dst.put_u16(self.port);
    }

    fn decode(src: &mut Bytes) -> Result<Self, MessageError> {
        need(src, Self::SIZE)?;
        let services = ServiceFlags::from_bits_retain(src.get_u64_le());
        let mut octets = [0u8; 16];
        src.copy_to_slice(&mut octets);
        let port = src.get_u16();
        Ok(Self {
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }
}

/// Address entry of an addr message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedAddr {
    /// Last-seen time, seconds since the epoch
    pub timestamp: u32,
    pub addr: NetAddr,
}

/// Inventory item type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
}

impl InvType {
    fn to_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
        }
    }

    /// Types we do not understand are treated like error entries
    fn from_u32(value: u32) -> Self {
        match value {
            1 => InvType::Tx,
            2 => InvType::Block,
            _ => InvType::Error,
        }
    }
}

/// Inventory item: an object a peer announces or we request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: BlockHash,
}

impl InvItem {
    pub fn new(kind: InvType, hash: BlockHash) -> Self {
        Self { kind, hash }
    }
}

/// Version message sent first on every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// Request for block hashes following the locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    /// All zeros requests as many blocks as the peer will send
    pub stop: BlockHash,
}

// =============================================================================
// Messages
// =============================================================================

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    /// Nonce echoed from our ping; absent if the peer sent no nonce
    Pong(Option<u64>),
    GetAddr,
    Addr(Vec<TimedAddr>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    /// Items from a getdata the peer cannot serve
    NotFound(Vec<InvItem>),
    GetBlocks(GetBlocksMessage),
    /// Serialized transaction, passed through untouched
    Tx(Bytes),
    /// Serialized block, passed through untouched
    Block(Bytes),
    /// A command we do not handle
    Unknown(String),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::GetAddr => Command::GetAddr,
            Message::Addr(_) => Command::Addr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::NotFound(_) => Command::NotFound,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::Tx(_) => Command::Tx,
            Message::Block(_) => Command::Block,
            Message::Unknown(name) => Command::Unknown(name.clone()),
        }
    }

    /// Serialize the payload (header excluded) into `dst`
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Message::Version(v) => {
                dst.put_i32_le(v.version);
                dst.put_u64_le(v.services.bits());
                dst.put_i64_le(v.timestamp);
                v.receiver.encode(dst);
                v.sender.encode(dst);
                dst.put_u64_le(v.nonce);
                put_var_int(dst, v.user_agent.len() as u64);
                dst.put_slice(v.user_agent.as_bytes());
                dst.put_i32_le(v.start_height);
            }
            Message::Verack | Message::GetAddr | Message::Unknown(_) => {}
            Message::Ping(nonce) => dst.put_u64_le(*nonce),
            Message::Pong(nonce) => {
                if let Some(nonce) = nonce {
                    dst.put_u64_le(*nonce);
                }
            }
            Message::Addr(addrs) => {
                put_var_int(dst, addrs.len() as u64);
                for entry in addrs {
                    dst.put_u32_le(entry.timestamp);
                    entry.addr.encode(dst);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                encode_inventory(items, dst)
            }
            Message::GetBlocks(req) => {
                dst.put_u32_le(req.version);
                put_var_int(dst, req.locator.len() as u64);
                for hash in &req.locator {
                    dst.put_slice(hash.as_bytes());
                }
                dst.put_slice(req.stop.as_bytes());
            }
            Message::Tx(raw) | Message::Block(raw) => dst.put_slice(raw),
        }
    }

    /// Decode a payload received under `command`
    pub fn decode(command: Command, mut payload: Bytes) -> Result<Self, MessageError> {
        let src = &mut payload;
        let msg = match command {
            Command::Version => {
                need(src, 20)?;
                let version = src.get_i32_le();
                let services = ServiceFlags::from_bits_retain(src.get_u64_le());
                let timestamp = src.get_i64_le();
                let receiver = NetAddr::decode(src)?;
                let sender = NetAddr::decode(src)?;
                need(src, 8)?;
                let nonce = src.get_u64_le();
                let len = get_var_int(src)? as usize;
                need(src, len)?;
                let user_agent = String::from_utf8(src.split_to(len).to_vec())
                    .map_err(|_| MessageError::InvalidUserAgent)?;
                need(src, 4)?;
                let start_height = src.get_i32_le();
                // A trailing relay flag, if present, is ignored
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    receiver,
                    sender,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            Command::Verack => Message::Verack,
            Command::Ping => {
                if src.len() != NONCE_SIZE {
                    return Err(MessageError::BadNonceLength(src.len()));
                }
                Message::Ping(src.get_u64_le())
            }
            Command::Pong => {
                if src.len() == NONCE_SIZE {
                    Message::Pong(Some(src.get_u64_le()))
                } else {
                    Message::Pong(None)
                }
            }
            Command::GetAddr => Message::GetAddr,
            Command::Addr => {
                let count = get_count(src, MAX_ADDR_PER_MESSAGE)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    need(src, 4)?;
                    let timestamp = src.get_u32_le();
                    let addr = NetAddr::decode(src)?;
                    addrs.push(TimedAddr { timestamp, addr });
                }
                Message::Addr(addrs)
            }
            Command::Inv => Message::Inv(decode_inventory(src)?),
            Command::GetData => Message::GetData(decode_inventory(src)?),
            Command::NotFound => Message::NotFound(decode_inventory(src)?),
            Command::GetBlocks => {
                need(src, 4)?;
                let version = src.get_u32_le();
                let count = get_count(src, MAX_LOCATOR_HASHES)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(get_hash(src)?);
                }
                let stop = get_hash(src)?;
                Message::GetBlocks(GetBlocksMessage {
                    version,
                    locator,
                    stop,
                })
            }
            Command::Tx => Message::Tx(payload),
            Command::Block => Message::Block(payload),
            Command::Unknown(name) => Message::Unknown(name),
        };
        Ok(msg)
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn encode_inventory(items: &[InvItem], dst: &mut BytesMut) {
    put_var_int(dst, items.len() as u64);
    for item in items {
        dst.put_u32_le(item.kind.to_u32());
        dst.put_slice(item.hash.as_bytes());
    }
}

fn decode_inventory(src: &mut Bytes) -> Result<Vec<InvItem>, MessageError> {
    let count = get_count(src, MAX_INV_PER_MESSAGE)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        need(src, 4)?;
        let kind = InvType::from_u32(src.get_u32_le());
        items.push(InvItem::new(kind, get_hash(src)?));
    }
    Ok(items)
}

fn need(src: &Bytes, n: usize) -> Result<(), MessageError> {
    if src.remaining() < n {
        return Err(MessageError::Truncated {
            needed: n - src.remaining(),
        });
    }
    Ok(())
}

fn get_hash(src: &mut Bytes) -> Result<BlockHash, MessageError> {
    need(src, 32)?;
    let mut hash = [0u8; 32];
    src.copy_to_slice(&mut hash);
    Ok(BlockHash(hash))
}

fn get_count(src: &mut Bytes, max: usize) -> Result<usize, MessageError> {
    let count = get_var_int(src)?;
    if count > max as u64 {
        return Err(MessageError::TooManyEntries(count));
    }
    Ok(count as usize)
}

/// Write a CompactSize integer
pub fn put_var_int(dst: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => dst.put_u8(value as u8),
        0xfd..=0xffff => {
            dst.put_u8(0xfd);
            dst.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            dst.put_u8(0xfe);
            dst.put_u32_le(value as u32);
        }
        _ => {
            dst.put_u8(0xff);
            dst.put_u64_le(value);
        }
    }
}

/// Read a CompactSize integer
pub fn get_var_int(src: &mut Bytes) -> Result<u64, MessageError> {
    need(src, 1)?;
    let value = match src.get_u8() {
        0xfd => {
            need(src, 2)?;
            u64::from(src.get_u16_le())
        }
        0xfe => {
            need(src, 4)?;
            u64::from(src.get_u32_le())
        }
        0xff => {
            need(src, 8)?;
            src.get_u64_le()
        }
        small => u64::from(small),
    };
    Ok(value)
}
