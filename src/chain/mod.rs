//! Chain state adapter
//!
//! This module contains:
//! - Block and hash types (blocks stay in serialized form)
//! - The storage collaborator trait and an in-memory store
//! - Locator construction and inventory filtering for block sync

pub mod block;
pub mod locator;
pub mod store;

pub use block::{Block, BlockError, BlockHash, BLOCK_HEADER_SIZE};
pub use locator::{build_locator, filter_unknown};
pub use store::{BranchId, ChainError, ChainStore, MemoryChain, MAIN_BRANCH};
