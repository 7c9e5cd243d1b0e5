//! The page evictors.

use std::collections::HashSet;

use hashlink::LinkedHashSet;
use parking_lot::Mutex;

use super::id::{block_id_of_file, BlockId, PageId};

/// The evict policy of a cache directory.
///
/// An evictor records page accesses, keeps a set of pinned blocks whose
/// pages must not be selected as victims, and picks victims on demand.
pub trait Evictor: Send + Sync {
    /// Record a page read.
    fn update_on_get(&self, page_id: &PageId);

    /// Record a page write.
    /// Create a new entry if the page has not been seen before.
    fn update_on_put(&self, page_id: &PageId);

    /// Remove a page from the policy.
    fn update_on_delete(&self, page_id: &PageId);

    /// Select a victim page, skipping pages of pinned blocks.
    fn evict(&self) -> Option<PageId>;

    /// Pin a block. Returns `true` iff the block transitions from unpinned
    /// to pinned, so the caller can undo the pin symmetrically.
    fn add_pinned_block(&self, block_id: BlockId) -> bool;

    /// Unpin a block.
    fn remove_pinned_block(&self, block_id: BlockId);
}

/// The evict policy based on LRU.
#[derive(Debug, Default)]
pub struct LruEvictor {
    /// Pages in access order, least recent in front
    inner: Mutex<LinkedHashSet<PageId>>,
    /// Blocks that may not be evicted
    pinned: Mutex<HashSet<BlockId>>,
}

impl LruEvictor {
    /// Create a new `LruEvictor`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evictor for LruEvictor {
    fn update_on_get(&self, page_id: &PageId) {
        self.inner.lock().to_back(page_id);
    }

    fn update_on_put(&self, page_id: &PageId) {
        let mut lru = self.inner.lock();
        if !lru.insert(page_id.clone()) {
            lru.to_back(page_id);
        }
    }

    fn update_on_delete(&self, page_id: &PageId) {
        self.inner.lock().remove(page_id);
    }

    fn evict(&self) -> Option<PageId> {
        let lru = self.inner.lock();
        let pinned = self.pinned.lock();
        lru.iter()
            .find(|page| {
                block_id_of_file(&page.file_id)
                    .map_or(true, |block_id| !pinned.contains(&block_id))
            })
            .cloned()
    }

    fn add_pinned_block(&self, block_id: BlockId) -> bool {
        self.pinned.lock().insert(block_id)
    }

    fn remove_pinned_block(&self, block_id: BlockId) {
        self.pinned.lock().remove(&block_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::id::block_file_id;
    use super::*;

    fn page(block_id: BlockId, index: u64) -> PageId {
        PageId::new(block_file_id(block_id, 8192), index)
    }

    #[test]
    fn test_lru_order() {
        let evictor = LruEvictor::new();
        evictor.update_on_put(&page(1, 0));
        evictor.update_on_put(&page(1, 1));
        evictor.update_on_put(&page(2, 0));

        // Touch the oldest page, the next victim moves to block 1 page 1.
        evictor.update_on_get(&page(1, 0));
        assert_eq!(evictor.evict(), Some(page(1, 1)));
    }

    #[test]
    fn test_pinned_block_is_skipped() {
        let evictor = LruEvictor::new();
        evictor.update_on_put(&page(1, 0));
        evictor.update_on_put(&page(2, 0));

        assert!(evictor.add_pinned_block(1));
        // Pinning twice reports no transition.
        assert!(!evictor.add_pinned_block(1));

        assert_eq!(evictor.evict(), Some(page(2, 0)));

        evictor.remove_pinned_block(1);
        assert_eq!(evictor.evict(), Some(page(1, 0)));

        // A fresh pin transitions again after the unpin.
        assert!(evictor.add_pinned_block(1));
    }

    #[test]
    fn test_delete_removes_entry() {
        let evictor = LruEvictor::new();
        evictor.update_on_put(&page(1, 0));
        evictor.update_on_delete(&page(1, 0));
        assert_eq!(evictor.evict(), None);
    }
}
