//! The in-memory authority for block and page metadata.
//!
//! All mutating operations take the write side of the metadata lock, all
//! lookups take the read side. Multi-step operations (temp block creation,
//! commit, removal) are exposed as combined methods holding the write guard
//! for their whole span, so a caller can never interleave the metadata lock
//! with the per-block lock in the wrong order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::dir::PagedBlockStoreDir;
use super::error::{BlockStoreError, BlockStoreResult};
use super::id::{block_file_id, temp_file_id, BlockId, PageId};
use super::meta::{PagedBlockMeta, PagedTempBlockMeta};

/// Metadata of one unregistered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// The page id.
    pub page_id: PageId,
    /// The size of the page in bytes.
    pub page_size: u64,
    /// The directory the page lived in.
    pub dir_index: u32,
}

/// A snapshot of one directory for the master report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDirMeta {
    /// The directory index.
    pub dir_index: u32,
    /// The capacity of the directory in bytes.
    pub capacity_bytes: u64,
    /// Bytes of committed pages cached in the directory.
    pub cached_bytes: u64,
}

/// A snapshot of the store for the master report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    /// The total capacity over all directories.
    pub capacity_bytes: u64,
    /// The sum of committed block lengths.
    pub used_bytes: u64,
    /// The number of committed blocks.
    pub block_count: usize,
    /// Per-directory snapshots.
    pub dirs: Vec<StoreDirMeta>,
    /// The committed block ids, only in the full snapshot.
    pub block_list: Option<Vec<BlockId>>,
}

/// The tables guarded by the metadata lock.
#[derive(Debug, Default)]
struct MetaStoreState {
    /// Committed blocks.
    blocks: HashMap<BlockId, Arc<PagedBlockMeta>>,
    /// Temp blocks being written.
    temp_blocks: HashMap<BlockId, Arc<PagedTempBlockMeta>>,
    /// Round-robin cursor of the allocation policy.
    next_dir: usize,
}

/// The metadata store of the paged block store.
#[derive(Debug)]
pub struct PagedBlockMetaStore {
    /// The cache directories, fixed at construction.
    dirs: Vec<Arc<PagedBlockStoreDir>>,
    /// The metadata lock and the tables it guards.
    state: RwLock<MetaStoreState>,
}

impl PagedBlockMetaStore {
    /// Creates a new `PagedBlockMetaStore` over the given directories.
    ///
    /// # Panics
    /// Panics when `dirs` is empty.
    #[must_use]
    pub fn new(dirs: Vec<Arc<PagedBlockStoreDir>>) -> Self {
        assert!(!dirs.is_empty(), "at least one cache dir is required");
        Self {
            dirs,
            state: RwLock::new(MetaStoreState::default()),
        }
    }

    /// The cache directories.
    #[must_use]
    pub fn dirs(&self) -> &[Arc<PagedBlockStoreDir>] {
        &self.dirs
    }

    /// Choose a directory with at least `size` bytes of free capacity and
    /// reserve them under `file_id`. Deterministic round-robin.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when no directory fits.
    pub async fn allocate(
        &self,
        file_id: &str,
        size: u64,
    ) -> BlockStoreResult<Arc<PagedBlockStoreDir>> {
        let mut state = self.state.write().await;
        self.allocate_locked(&mut state, file_id, size)
    }

    /// Whether the block is committed.
    pub async fn has_block(&self, block_id: BlockId) -> bool {
        self.state.read().await.blocks.contains_key(&block_id)
    }

    /// The committed block, if any.
    pub async fn get_block(&self, block_id: BlockId) -> Option<Arc<PagedBlockMeta>> {
        self.state.read().await.blocks.get(&block_id).cloned()
    }

    /// Whether the block is a temp block.
    pub async fn has_temp_block(&self, block_id: BlockId) -> bool {
        self.state.read().await.temp_blocks.contains_key(&block_id)
    }

    /// The temp block, if any.
    pub async fn get_temp_block(&self, block_id: BlockId) -> Option<Arc<PagedTempBlockMeta>> {
        self.state.read().await.temp_blocks.get(&block_id).cloned()
    }

    /// Reserve space for a new temp block without registering its metadata.
    ///
    /// # Errors
    /// Returns `AlreadyExists` when the block id is known, or
    /// `ResourceExhausted` when no directory fits.
    pub async fn reserve_temp_block(
        &self,
        block_id: BlockId,
        initial_bytes: u64,
    ) -> BlockStoreResult<Arc<PagedBlockStoreDir>> {
        let mut state = self.state.write().await;
        if state.blocks.contains_key(&block_id) || state.temp_blocks.contains_key(&block_id) {
            return Err(BlockStoreError::AlreadyExists(block_id));
        }
        let file_id = temp_file_id(block_id);
        let dir = self.allocate_locked(&mut state, &file_id, initial_bytes)?;
        dir.put_temp_file(&file_id);
        Ok(dir)
    }

    /// Register a new temp block, reserving space for it.
    ///
    /// # Errors
    /// Returns `AlreadyExists` when the block id is known, or
    /// `ResourceExhausted` when no directory fits.
    pub async fn create_temp_block(
        &self,
        block_id: BlockId,
    ) -> BlockStoreResult<Arc<PagedTempBlockMeta>> {
        let mut state = self.state.write().await;
        if state.blocks.contains_key(&block_id) || state.temp_blocks.contains_key(&block_id) {
            return Err(BlockStoreError::AlreadyExists(block_id));
        }
        let file_id = temp_file_id(block_id);
        let dir = self.allocate_locked(&mut state, &file_id, 0)?;
        dir.put_temp_file(&file_id);
        let meta = Arc::new(PagedTempBlockMeta::new(block_id, dir));
        state.temp_blocks.insert(block_id, Arc::clone(&meta));
        Ok(meta)
    }

    /// Atomically promote a fully written temp block to a committed one,
    /// renaming its pages in the owning directory.
    ///
    /// # Errors
    /// Returns `NotFound` when no temp block exists, `AlreadyExists` when a
    /// committed block with the same id exists, `InvalidState` when the
    /// block is not fully written.
    pub async fn commit_temp_block(
        &self,
        block_id: BlockId,
    ) -> BlockStoreResult<Arc<PagedBlockMeta>> {
        let mut state = self.state.write().await;
        let Some(temp_meta) = state.temp_blocks.get(&block_id).cloned() else {
            return Err(BlockStoreError::NotFound(format!("block {block_id}")));
        };
        if state.blocks.contains_key(&block_id) {
            return Err(BlockStoreError::AlreadyExists(block_id));
        }
        let dir = Arc::clone(temp_meta.dir());
        let block_size = temp_meta.block_size();
        if block_size != dir.temp_block_cached_bytes(block_id) {
            return Err(BlockStoreError::InvalidState(format!(
                "committing block {block_id} which has not been fully written"
            )));
        }
        // The rename is metadata-only in the directory, the one I/O allowed
        // under the metadata write lock.
        dir.commit(
            &temp_file_id(block_id),
            &block_file_id(block_id, block_size),
            block_id,
        )
        .await?;
        state.temp_blocks.remove(&block_id);
        let meta = Arc::new(PagedBlockMeta::new(block_id, block_size, dir));
        state.blocks.insert(block_id, Arc::clone(&meta));
        debug!("committed block {block_id} of {block_size} bytes");
        Ok(meta)
    }

    /// Discard a temp block and its pages.
    ///
    /// # Errors
    /// Returns `NotFound` when no temp block exists, or the underlying
    /// delete error.
    pub async fn abort_temp_block(
        &self,
        block_id: BlockId,
    ) -> BlockStoreResult<Arc<PagedTempBlockMeta>> {
        let mut state = self.state.write().await;
        let Some(temp_meta) = state.temp_blocks.get(&block_id).cloned() else {
            return Err(BlockStoreError::NotFound(format!("block {block_id}")));
        };
        temp_meta.dir().abort(&temp_file_id(block_id)).await?;
        state.temp_blocks.remove(&block_id);
        Ok(temp_meta)
    }

    /// Remove a committed block and delete all its pages.
    ///
    /// # Errors
    /// Returns `InvalidState` for a temp block, `NotFound` for an unknown
    /// block, or the underlying delete error.
    pub async fn remove_block(
        &self,
        block_id: BlockId,
    ) -> BlockStoreResult<Arc<PagedBlockMeta>> {
        let mut state = self.state.write().await;
        if state.temp_blocks.contains_key(&block_id) {
            return Err(BlockStoreError::InvalidState(format!(
                "cannot remove uncommitted block {block_id}"
            )));
        }
        let Some(meta) = state.blocks.get(&block_id).cloned() else {
            return Err(BlockStoreError::NotFound(format!("block {block_id}")));
        };
        let dir = meta.dir();
        for page_id in dir.block_pages(block_id) {
            dir.delete_page(&page_id).await?;
        }
        state.blocks.remove(&block_id);
        Ok(meta)
    }

    /// Unregister one page and delete it from its directory.
    ///
    /// # Errors
    /// Returns `NotFound` when no directory holds the page.
    pub async fn remove_page(&self, page_id: &PageId) -> BlockStoreResult<PageInfo> {
        let _state = self.state.write().await;
        for dir in &self.dirs {
            if dir.has_page(page_id) {
                let page_size = dir.delete_page(page_id).await?;
                return Ok(PageInfo {
                    page_id: page_id.clone(),
                    page_size,
                    dir_index: dir.dir_index(),
                });
            }
        }
        Err(BlockStoreError::NotFound(format!(
            "page {}/{}",
            page_id.file_id, page_id.page_index
        )))
    }

    /// Look up a committed block and pin it in its directory.
    /// Returns the metadata and whether the block was previously unpinned.
    pub async fn get_block_and_pin(
        &self,
        block_id: BlockId,
    ) -> Option<(Arc<PagedBlockMeta>, bool)> {
        let state = self.state.read().await;
        let meta = state.blocks.get(&block_id).cloned()?;
        let previously_unpinned = meta.dir().evictor().add_pinned_block(block_id);
        Some((meta, previously_unpinned))
    }

    /// Register a block discovered on the UFS so its pages can be cached,
    /// and pin it. When another reader registered the block first, reuse
    /// its metadata.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when no directory fits the block.
    pub async fn register_block_for_read(
        &self,
        block_id: BlockId,
        block_size: u64,
    ) -> BlockStoreResult<(Arc<PagedBlockMeta>, bool)> {
        let mut state = self.state.write().await;
        if let Some(meta) = state.blocks.get(&block_id).cloned() {
            let previously_unpinned = meta.dir().evictor().add_pinned_block(block_id);
            return Ok((meta, previously_unpinned));
        }
        let file_id = block_file_id(block_id, block_size);
        let dir = self.allocate_locked(&mut state, &file_id, block_size)?;
        let meta = Arc::new(PagedBlockMeta::new(block_id, block_size, dir));
        state.blocks.insert(block_id, Arc::clone(&meta));
        let previously_unpinned = meta.dir().evictor().add_pinned_block(block_id);
        Ok((meta, previously_unpinned))
    }

    /// Snapshot used bytes, capacities and directory stats.
    pub async fn store_meta(&self) -> StoreMeta {
        self.snapshot(false).await
    }

    /// Snapshot including the committed block list.
    pub async fn store_meta_full(&self) -> StoreMeta {
        self.snapshot(true).await
    }

    /// Build a snapshot under the read lock.
    async fn snapshot(&self, full: bool) -> StoreMeta {
        let state = self.state.read().await;
        let used_bytes = state.blocks.values().map(|meta| meta.block_size()).sum();
        let dirs: Vec<StoreDirMeta> = self
            .dirs
            .iter()
            .map(|dir| StoreDirMeta {
                dir_index: dir.dir_index(),
                capacity_bytes: dir.capacity(),
                cached_bytes: dir.cached_bytes(),
            })
            .collect();
        let block_list = full.then(|| {
            let mut blocks: Vec<BlockId> = state.blocks.keys().copied().collect();
            blocks.sort_unstable();
            blocks
        });
        StoreMeta {
            capacity_bytes: dirs.iter().map(|dir| dir.capacity_bytes).sum(),
            used_bytes,
            block_count: state.blocks.len(),
            dirs,
            block_list,
        }
    }

    /// The allocation policy: round-robin over directories that can fit the
    /// reservation.
    fn allocate_locked(
        &self,
        state: &mut MetaStoreState,
        file_id: &str,
        size: u64,
    ) -> BlockStoreResult<Arc<PagedBlockStoreDir>> {
        // Allocation is idempotent by file id: a file already holding a
        // reservation keeps its directory.
        if let Some(dir) = self.dirs.iter().find(|dir| dir.has_reservation(file_id)) {
            return Ok(Arc::clone(dir));
        }
        let dir_count = self.dirs.len();
        let start = state.next_dir;
        for (offset, dir) in self
            .dirs
            .iter()
            .cycle()
            .skip(start)
            .take(dir_count)
            .enumerate()
        {
            if dir.reserve(file_id, size) {
                state.next_dir = (start + offset + 1) % dir_count;
                return Ok(Arc::clone(dir));
            }
        }
        Err(BlockStoreError::ResourceExhausted(size))
    }
}
