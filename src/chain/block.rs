//! Block and block hash types
//!
//! Blocks are kept in their serialized wire form. Only the 80-byte header is
//! interpreted here; transaction data is opaque to the networking core.

use crate::crypto::{double_sha256, sha256};
use std::fmt;
use thiserror::Error;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Genesis header fields
const GENESIS_VERSION: i32 = 1;
const GENESIS_TIMESTAMP: u32 = 1_231_006_505;
const GENESIS_BITS: u32 = 0x1d00_ffff;
const GENESIS_NONCE: u32 = 2_083_236_893;

/// Block parsing errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Block too short: {0} bytes")]
    TooShort(usize),
}

/// A 32-byte block hash in internal (little-endian) byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as "no stop hash" in getblocks
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    // Displayed byte-reversed, the way block explorers print hashes
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

/// A block in serialized form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    bytes: Vec<u8>,
}

impl Block {
    /// Wrap a serialized block received from the network
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, BlockError> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(BlockError::TooShort(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// Build a block with no transactions on top of `prev`
    pub fn new(prev: BlockHash, merkle_root: [u8; 32], timestamp: u32, bits: u32, nonce: u32) -> Self {
        let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE + 1);
        bytes.extend_from_slice(&GENESIS_VERSION.to_le_bytes());
        bytes.extend_from_slice(prev.as_bytes());
        bytes.extend_from_slice(&merkle_root);
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes.extend_from_slice(&bits.to_le_bytes());
        bytes.extend_from_slice(&nonce.to_le_bytes());
        // Transaction count
        bytes.push(0);
        Self { bytes }
    }

    /// The fixed genesis block every node starts from
    pub fn genesis() -> Self {
        Self::new(
            BlockHash::ZERO,
            sha256(b"relay-node genesis"),
            GENESIS_TIMESTAMP,
            GENESIS_BITS,
            GENESIS_NONCE,
        )
    }

    /// Build a child of `parent`, varying the nonce so siblings differ
    pub fn child_of(parent: &Block, nonce: u32) -> Self {
        Self::new(
            parent.hash(),
            sha256(&nonce.to_le_bytes()),
            parent.timestamp().saturating_add(600),
            GENESIS_BITS,
            nonce,
        )
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..BLOCK_HEADER_SIZE]
    }

    /// Double SHA-256 of the header
    pub fn hash(&self) -> BlockHash {
        BlockHash(double_sha256(self.header()))
    }

    pub fn prev_hash(&self) -> BlockHash {
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&self.bytes[4..36]);
        BlockHash(prev)
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes([self.bytes[68], self.bytes[69], self.bytes[70], self.bytes[71]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert_eq!(genesis.header().len(), BLOCK_HEADER_SIZE);
        assert_eq!(genesis.prev_hash(), BlockHash::ZERO);
        assert_eq!(genesis.timestamp(), GENESIS_TIMESTAMP);
        assert_eq!(genesis.hash(), Block::genesis().hash());
    }

    #[test]
    fn test_child_links_to_parent() {
        let genesis = Block::genesis();
        let child = Block::child_of(&genesis, 1);
        assert_eq!(child.prev_hash(), genesis.hash());
        assert_ne!(child.hash(), Block::child_of(&genesis, 2).hash());
    }

    #[test]
    fn test_short_block_rejected() {
        assert!(Block::from_bytes(vec![0u8; 40]).is_err());
        let bytes = Block::genesis().as_bytes().to_vec();
        assert_eq!(Block::from_bytes(bytes).unwrap(), Block::genesis());
    }

    #[test]
    fn test_hash_display_is_reversed() {
        let mut raw = [0u8; 32];
        raw[0] = 0xab;
        let hash = BlockHash(raw);
        assert!(hash.to_string().ends_with("ab"));
        assert_eq!(format!("{:?}", hash), format!("BlockHash({})", hash));
    }
}
