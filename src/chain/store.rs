//! Chain storage collaborator
//!
//! The networking core never owns chain state. It reads it through the
//! [`ChainStore`] trait and hands received blocks and transactions back to it.
//! [`MemoryChain`] is a simple in-memory store holding a single main branch.

use crate::chain::block::{Block, BlockError, BlockHash};
use std::collections::HashMap;
use thiserror::Error;

/// Identifier of a branch inside the store
pub type BranchId = u8;

/// Branch id of the main chain in [`MemoryChain`]
pub const MAIN_BRANCH: BranchId = 0;

/// Chain storage errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),
    #[error("Block index {index} out of range for branch {branch}")]
    IndexOutOfRange { index: u32, branch: BranchId },
    #[error("Orphan block {0}: parent unknown")]
    Orphan(BlockHash),
    #[error("Malformed block: {0}")]
    Malformed(#[from] BlockError),
}

/// Read/write access to externally owned chain state
pub trait ChainStore {
    /// Whether a block with this hash is stored on any branch
    fn block_exists(&self, hash: &BlockHash) -> bool;

    /// The branch currently considered best
    fn main_branch(&self) -> BranchId;

    /// Number of blocks on `branch`, genesis included
    fn branch_block_count(&self, branch: BranchId) -> u32;

    /// Load the block at `index` on `branch`
    fn load_block(&self, index: u32, branch: BranchId) -> Result<Block, ChainError>;

    /// Look a block up by hash on any branch
    fn find_block(&self, hash: &BlockHash) -> Option<Block>;

    /// Position of `hash` on the main branch, if it lies on it
    fn main_index_of(&self, hash: &BlockHash) -> Option<u32>;

    /// Hand a block received from a peer to the validator
    fn process_block(&mut self, block: Block) -> Result<(), ChainError>;

    /// Hand a transaction received from a peer to the validator
    fn process_transaction(&mut self, payload: &[u8]) {
        log::debug!("Dropping {} byte transaction: no relay", payload.len());
    }

    fn block_hash(&self, block: &Block) -> BlockHash {
        block.hash()
    }

    /// Index of the highest block on the main branch
    fn best_height(&self) -> u32 {
        self.branch_block_count(self.main_branch()).saturating_sub(1)
    }
}

/// In-memory chain with a single main branch
#[derive(Debug, Clone)]
pub struct MemoryChain {
    blocks: Vec<Block>,
    by_hash: HashMap<BlockHash, u32>,
}

impl MemoryChain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), 0);
        Self {
            blocks: vec![genesis],
            by_hash,
        }
    }

    /// Create a chain of synthetic blocks whose tip sits at `height`
    pub fn with_height(height: u32) -> Self {
        let mut chain = Self::new();
        for nonce in 1..=height {
            let block = Block::child_of(chain.tip(), nonce);
            chain.append(block);
        }
        chain
    }

    pub fn tip(&self) -> &Block {
        // Genesis is inserted on construction and never removed
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    fn append(&mut self, block: Block) {
        self.by_hash.insert(block.hash(), self.blocks.len() as u32);
        self.blocks.push(block);
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChain {
    fn block_exists(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn main_branch(&self) -> BranchId {
        MAIN_BRANCH
    }

    fn branch_block_count(&self, branch: BranchId) -> u32 {
        if branch == MAIN_BRANCH {
            self.blocks.len() as u32
        } else {
            0
        }
    }

    fn load_block(&self, index: u32, branch: BranchId) -> Result<Block, ChainError> {
        if branch != MAIN_BRANCH {
            return Err(ChainError::UnknownBranch(branch));
        }
        self.blocks
            .get(index as usize)
            .cloned()
            .ok_or(ChainError::IndexOutOfRange { index, branch })
    }

    fn find_block(&self, hash: &BlockHash) -> Option<Block> {
        self.by_hash
            .get(hash)
            .and_then(|i| self.blocks.get(*i as usize))
            .cloned()
    }

    fn main_index_of(&self, hash: &BlockHash) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    fn process_block(&mut self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.block_exists(&hash) {
            log::debug!("Block {} already stored", hash);
            return Ok(());
        }
        if block.prev_hash() != self.tip().hash() {
            return Err(ChainError::Orphan(hash));
        }

        self.append(block);
        log::info!("Stored block {} at height {}", hash, self.height());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chain() {
        let chain = MemoryChain::new();
        assert_eq!(chain.branch_block_count(MAIN_BRANCH), 1);
        assert_eq!(chain.best_height(), 0);
        assert!(chain.block_exists(&Block::genesis().hash()));
    }

    #[test]
    fn test_with_height() {
        let chain = MemoryChain::with_height(15);
        assert_eq!(chain.best_height(), 15);
        let block = chain.load_block(7, MAIN_BRANCH).unwrap();
        assert_eq!(chain.main_index_of(&block.hash()), Some(7));
        assert_eq!(chain.block_hash(&block), block.hash());
        assert!(chain.load_block(16, MAIN_BRANCH).is_err());
        assert!(chain.load_block(0, 3).is_err());
    }

    #[test]
    fn test_process_block_extends_tip() {
        let mut chain = MemoryChain::new();
        let child = Block::child_of(chain.tip(), 9);
        chain.process_block(child.clone()).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.find_block(&child.hash()), Some(child.clone()));

        // Duplicates are accepted silently
        chain.process_block(child).unwrap();
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_orphan_rejected() {
        let mut chain = MemoryChain::new();
        let stranger = MemoryChain::with_height(3);
        let orphan = stranger.tip().clone();
        assert!(matches!(
            chain.process_block(orphan),
            Err(ChainError::Orphan(_))
        ));
        assert_eq!(chain.height(), 0);
    }
}
