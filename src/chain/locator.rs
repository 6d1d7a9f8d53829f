//! Block locator construction and inventory filtering
//!
//! The locator lists main-branch hashes from the tip backwards, one by one
//! for the first ten entries and then with a doubling stride, so a peer can
//! find our most recent common ancestor in a handful of round trips.

use crate::chain::block::BlockHash;
use crate::chain::store::{ChainError, ChainStore};
use crate::network::message::{InvItem, InvType};

/// Entries emitted with stride 1 before the stride starts doubling
const DENSE_LOCATOR_ENTRIES: usize = 10;

/// Build a locator for the store's main branch, most recent first.
///
/// The genesis hash always terminates the result, exactly once.
pub fn build_locator(store: &dyn ChainStore) -> Result<Vec<BlockHash>, ChainError> {
    let branch = store.main_branch();
    let top = store.branch_block_count(branch).saturating_sub(1);

    let mut locator = Vec::new();
    let mut index = i64::from(top);
    let mut step = 1i64;
    let mut start = 0usize;

    while index > 0 {
        if start >= DENSE_LOCATOR_ENTRIES {
            step *= 2;
        }
        let block = store.load_block(index as u32, branch)?;
        locator.push(store.block_hash(&block));
        index -= step;
        start += 1;
    }

    let genesis = store.block_hash(&store.load_block(0, branch)?);
    if locator.last() != Some(&genesis) {
        locator.push(genesis);
    }

    Ok(locator)
}

/// Keep the block announcements whose hash the store does not know yet.
///
/// Relative order is preserved; transaction and error items are dropped.
pub fn filter_unknown(store: &dyn ChainStore, items: &[InvItem]) -> Vec<InvItem> {
    items
        .iter()
        .filter(|item| item.kind == InvType::Block && !store.block_exists(&item.hash))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::store::{MemoryChain, MAIN_BRANCH};

    fn hashes_at(chain: &MemoryChain, indices: &[u32]) -> Vec<BlockHash> {
        indices
            .iter()
            .map(|i| chain.load_block(*i, MAIN_BRANCH).unwrap().hash())
            .collect()
    }

    #[test]
    fn test_locator_doubles_after_ten_entries() {
        let chain = MemoryChain::with_height(15);
        let locator = build_locator(&chain).unwrap();

        let expected = hashes_at(&chain, &[15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 3, 0]);
        assert_eq!(locator.len(), 13);
        assert_eq!(locator, expected);
    }

    #[test]
    fn test_small_chain_locator() {
        let chain = MemoryChain::with_height(5);
        let locator = build_locator(&chain).unwrap();
        assert_eq!(locator, hashes_at(&chain, &[5, 4, 3, 2, 1, 0]));
    }

    #[test]
    fn test_genesis_only_locator() {
        let chain = MemoryChain::new();
        let locator = build_locator(&chain).unwrap();
        assert_eq!(locator, hashes_at(&chain, &[0]));
    }

    #[test]
    fn test_locator_stays_logarithmic() {
        let chain = MemoryChain::with_height(2000);
        let locator = build_locator(&chain).unwrap();
        assert!(locator.len() < 25);
        assert_eq!(locator[0], chain.tip().hash());
        assert_eq!(*locator.last().unwrap(), hashes_at(&chain, &[0])[0]);
    }

    #[test]
    fn test_filter_unknown() {
        let chain = MemoryChain::with_height(3);
        let h1 = BlockHash([1u8; 32]);
        let h2 = BlockHash([2u8; 32]);
        let h3 = chain.tip().hash();

        let items = vec![
            InvItem::new(InvType::Block, h1),
            InvItem::new(InvType::Tx, h2),
            InvItem::new(InvType::Block, h3),
        ];
        let unknown = filter_unknown(&chain, &items);
        assert_eq!(unknown, vec![InvItem::new(InvType::Block, h1)]);
    }

    #[test]
    fn test_filter_keeps_order() {
        let chain = MemoryChain::new();
        let items: Vec<InvItem> = (10u8..15)
            .map(|b| InvItem::new(InvType::Block, BlockHash([b; 32])))
            .collect();
        assert_eq!(filter_unknown(&chain, &items), items);
    }
}
