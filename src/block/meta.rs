//! Metadata of committed and temp blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::dir::PagedBlockStoreDir;
use super::id::BlockId;

/// Metadata of a committed block. Immutable after creation.
#[derive(Debug)]
pub struct PagedBlockMeta {
    /// The block id.
    block_id: BlockId,
    /// The length of the block in bytes.
    block_size: u64,
    /// The directory holding the pages of this block.
    dir: Arc<PagedBlockStoreDir>,
}

impl PagedBlockMeta {
    /// Creates a new `PagedBlockMeta`.
    #[must_use]
    pub fn new(block_id: BlockId, block_size: u64, dir: Arc<PagedBlockStoreDir>) -> Self {
        Self {
            block_id,
            block_size,
            dir,
        }
    }

    /// The block id.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The length of the block in bytes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The directory holding the pages of this block.
    #[must_use]
    pub fn dir(&self) -> &Arc<PagedBlockStoreDir> {
        &self.dir
    }
}

/// Metadata of a block in the process of being written.
/// Its length grows as the writer appends pages and becomes final on commit.
#[derive(Debug)]
pub struct PagedTempBlockMeta {
    /// The block id.
    block_id: BlockId,
    /// The directory holding the temp pages of this block.
    dir: Arc<PagedBlockStoreDir>,
    /// Bytes appended by the writer so far.
    block_size: AtomicU64,
}

impl PagedTempBlockMeta {
    /// Creates a new `PagedTempBlockMeta`.
    #[must_use]
    pub fn new(block_id: BlockId, dir: Arc<PagedBlockStoreDir>) -> Self {
        Self {
            block_id,
            dir,
            block_size: AtomicU64::new(0),
        }
    }

    /// The block id.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The directory holding the temp pages of this block.
    #[must_use]
    pub fn dir(&self) -> &Arc<PagedBlockStoreDir> {
        &self.dir
    }

    /// Bytes appended by the writer so far.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Acquire)
    }

    /// Record that the writer has appended up to `size` bytes.
    pub fn set_block_size(&self, size: u64) {
        self.block_size.store(size, Ordering::Release);
    }
}
