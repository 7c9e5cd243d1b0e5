//! The paged block store facade.
//!
//! Implements the block level operations, but instead of using physical
//! block files the data lives in pages spread over the cache directories.
//! Operations are keyed by a session id that scopes lock ownership; block
//! ids are supplied by the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use super::error::{BlockStoreError, BlockStoreResult};
use super::id::{block_file_id, BlockId, SessionId};
use super::listener::{BlockStoreEventListener, BlockStoreLocation, ListenerRegistry};
use super::lock_manager::{BlockLock, BlockLockManager, BlockLockMode};
use super::master::BlockMasterClientPool;
use super::meta::PagedBlockMeta;
use super::meta_store::{PagedBlockMetaStore, StoreMeta};
use super::reader::{
    DelegatingBlockReader, OpenUfsBlockOptions, PagedBlockReader, PagedUfsBlockReader,
};
use super::ufs::{UfsInputStreamCache, UnderFileSystem};
use super::writer::PagedBlockWriter;
use super::PagedBlockStoreDir;
use crate::config::Config;
use crate::metrics::BLOCK_METRICS;

/// Options of `create_block`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateBlockOptions {
    /// Bytes to reserve in the chosen directory up front.
    pub initial_bytes: u64,
}

/// A paged implementation of the worker block store.
pub struct PagedBlockStore {
    /// The per-block lock manager.
    lock_manager: BlockLockManager,
    /// The metadata authority.
    meta_store: Arc<PagedBlockMetaStore>,
    /// Clients for reporting commits to the block master.
    master_client_pool: Arc<BlockMasterClientPool>,
    /// The id of this worker as registered with the master.
    worker_id: Arc<AtomicU64>,
    /// The cache of open UFS streams.
    ufs_stream_cache: Arc<UfsInputStreamCache>,
    /// The registered event listeners.
    listeners: Arc<ListenerRegistry>,
    /// A set of pinned inodes updated via periodic master-worker sync.
    /// Advisory input to the allocation policy.
    pinned_inodes: Mutex<HashSet<u64>>,
    /// The page size of the store.
    page_size: u64,
    /// Bound on the exclusive lock wait during `remove_block`.
    remove_block_timeout: Duration,
    /// The tier label reported to the master.
    tier: String,
    /// The medium label reported to the master.
    medium: String,
}

impl std::fmt::Debug for PagedBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedBlockStore")
            .field("page_size", &self.page_size)
            .field("meta_store", &self.meta_store)
            .finish_non_exhaustive()
    }
}

impl PagedBlockStore {
    /// Creates a new `PagedBlockStore` from its collaborators.
    #[must_use]
    pub fn new(
        meta_store: Arc<PagedBlockMetaStore>,
        master_client_pool: Arc<BlockMasterClientPool>,
        worker_id: Arc<AtomicU64>,
        ufs: UnderFileSystem,
        config: &Config,
    ) -> Self {
        Self {
            lock_manager: BlockLockManager::new(),
            meta_store,
            master_client_pool,
            worker_id,
            ufs_stream_cache: Arc::new(UfsInputStreamCache::new(ufs)),
            listeners: Arc::new(ListenerRegistry::new()),
            pinned_inodes: Mutex::new(HashSet::new()),
            page_size: config.block_store.page_size,
            remove_block_timeout: Duration::from_millis(config.block_store.remove_block_timeout_ms),
            tier: config.block_store.default_tier.clone(),
            medium: config.block_store.default_medium.clone(),
        }
    }

    /// Creates a store with file-system cache directories taken from the
    /// config.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or a directory operator
    /// cannot be built.
    pub fn create(
        config: &Config,
        ufs: UnderFileSystem,
        master_client_pool: Arc<BlockMasterClientPool>,
        worker_id: Arc<AtomicU64>,
    ) -> BlockStoreResult<Self> {
        config.validate()?;
        let mut dirs = Vec::with_capacity(config.block_store.cache_dirs.len());
        for (index, root) in config.block_store.cache_dirs.iter().enumerate() {
            dirs.push(Arc::new(PagedBlockStoreDir::file_system(
                index.try_into().unwrap_or(u32::MAX),
                config.block_store.cache_dir_capacity,
                root,
            )?));
        }
        let meta_store = Arc::new(PagedBlockMetaStore::new(dirs));
        Ok(Self::new(
            meta_store,
            master_client_pool,
            worker_id,
            ufs,
            config,
        ))
    }

    /// The metadata store of this block store.
    #[must_use]
    pub fn meta_store(&self) -> &Arc<PagedBlockMetaStore> {
        &self.meta_store
    }

    /// The page size of this store.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Register a block store event listener.
    pub fn register_block_store_event_listener(
        &self,
        listener: Arc<dyn BlockStoreEventListener>,
    ) {
        self.listeners.register(listener);
    }

    /// Pin a block under a shared lock. Returns the lock handle when the
    /// block is present, otherwise the lock is released and `None` comes
    /// back.
    pub async fn pin_block(&self, session_id: SessionId, block_id: BlockId) -> Option<BlockLock> {
        debug!("pin_block: session_id={session_id}, block_id={block_id}");
        let lock = self
            .lock_manager
            .acquire(session_id, block_id, BlockLockMode::Shared)
            .await;
        if self.meta_store.has_block(block_id).await {
            return Some(lock);
        }
        drop(lock);
        None
    }

    /// Release the shared lock taken by `pin_block`.
    pub fn unpin_block(&self, lock: BlockLock) {
        debug!("unpin_block: id={}", lock.lock_id());
        drop(lock);
    }

    /// Allocate space for a new temp block in some directory.
    ///
    /// # Errors
    /// Returns `AlreadyExists` when the block id is known, or
    /// `ResourceExhausted` when no directory fits `initial_bytes`.
    pub async fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        options: &CreateBlockOptions,
    ) -> BlockStoreResult<()> {
        debug!(
            "create_block: session_id={session_id}, block_id={block_id}, initial_bytes={}",
            options.initial_bytes
        );
        self.meta_store
            .reserve_temp_block(block_id, options.initial_bytes)
            .await?;
        Ok(())
    }

    /// Create a writer targeting the temp pages of a new block.
    ///
    /// No block lock is taken here: the block is not visible to other
    /// clients until it is committed.
    ///
    /// # Errors
    /// Returns `AlreadyExists` when the block id is in either table.
    pub async fn create_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> BlockStoreResult<PagedBlockWriter> {
        debug!("create_block_writer: session_id={session_id}, block_id={block_id}");
        let temp_meta = self.meta_store.create_temp_block(block_id).await?;
        Ok(PagedBlockWriter::new(temp_meta, self.page_size))
    }

    /// Create a reader over a block.
    ///
    /// On a cache hit the block is pinned for the lifetime of the reader.
    /// On a miss with `no_cache` the block lock is released and a UFS-only
    /// reader comes back. On a miss with caching the block is registered,
    /// pinned, and on reader close the commit is reported to the master.
    ///
    /// # Errors
    /// Returns `NotFound` when the block is neither cached nor readable
    /// from the UFS, `OutOfRange` for an offset beyond the block.
    pub async fn create_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
        options: Option<OpenUfsBlockOptions>,
    ) -> BlockStoreResult<DelegatingBlockReader> {
        debug!("create_block_reader: session_id={session_id}, block_id={block_id}, offset={offset}");
        let block_lock = self
            .lock_manager
            .acquire(session_id, block_id, BlockLockMode::Shared)
            .await;

        if let Some((meta, previously_unpinned)) =
            self.meta_store.get_block_and_pin(block_id).await
        {
            return self.cached_block_reader(&meta, offset, options, block_lock, previously_unpinned);
        }

        // This is a block that needs to be read from the UFS.
        let Some(options) = options else {
            drop(block_lock);
            return Err(BlockStoreError::NotFound(format!(
                "block {block_id} is not cached and no UFS read options were given"
            )));
        };
        if options.no_cache {
            // In case someone else has added this block while we were not
            // holding the metadata lock, just use its metadata.
            if let Some((meta, previously_unpinned)) =
                self.meta_store.get_block_and_pin(block_id).await
            {
                return self.cached_block_reader(
                    &meta,
                    offset,
                    Some(options),
                    block_lock,
                    previously_unpinned,
                );
            }
            // The block does not need to be cached, no need to keep the
            // lock or register any metadata.
            drop(block_lock);
            let dir = self
                .meta_store
                .allocate(&block_file_id(block_id, options.block_size), options.block_size)
                .await?;
            let meta = Arc::new(PagedBlockMeta::new(block_id, options.block_size, dir));
            let ufs_reader = PagedUfsBlockReader::new(
                Arc::clone(&self.ufs_stream_cache),
                meta,
                options,
                self.page_size,
            );
            return Ok(DelegatingBlockReader::new(Box::new(ufs_reader), None, None));
        }

        let (meta, previously_unpinned) = self
            .meta_store
            .register_block_for_read(block_id, options.block_size)
            .await?;
        let location = BlockStoreLocation::new(self.tier.clone(), meta.dir().dir_index());
        let commit_on_close = self.commit_to_master_task(&meta, location);
        self.delegating_reader(
            &meta,
            offset,
            Some(options),
            block_lock,
            previously_unpinned,
            Some(commit_on_close),
        )
    }

    /// The legacy lock-id based reader over a physical block file. The
    /// paged store has no physical block files, so after validating the
    /// claimed lock this always fails.
    ///
    /// # Errors
    /// Returns `InvalidState` for a bogus lock claim, `NotFound` otherwise.
    pub async fn create_block_reader_locked(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        lock_id: u64,
    ) -> BlockStoreResult<DelegatingBlockReader> {
        debug!(
            "create_block_reader_locked: session_id={session_id}, block_id={block_id}, lock_id={lock_id}"
        );
        self.lock_manager.validate(session_id, block_id, lock_id)?;
        Err(BlockStoreError::NotFound(format!(
            "block {block_id} has no physical block file in the paged store"
        )))
    }

    /// Promote a fully written temp block, notify listeners and report to
    /// the master.
    ///
    /// The per-block exclusive lock is held through both listener
    /// emissions, so for one block id the local commit always precedes the
    /// master commit.
    ///
    /// # Errors
    /// Returns `NotFound` when no temp block exists, `InvalidState` when
    /// the block is not fully written, `Unavailable` when the master
    /// cannot be reached. The local commit is not rolled back on a master
    /// failure.
    pub async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        pin_on_create: bool,
    ) -> BlockStoreResult<()> {
        debug!(
            "commit_block: session_id={session_id}, block_id={block_id}, pin_on_create={pin_on_create}"
        );
        let block_lock = self
            .lock_manager
            .acquire(session_id, block_id, BlockLockMode::Exclusive)
            .await;
        let temp_meta = self
            .meta_store
            .get_temp_block(block_id)
            .await
            .ok_or_else(|| BlockStoreError::NotFound(format!("block {block_id}")))?;
        let evictor = temp_meta.dir().evictor();
        // Unconditionally pin this block until committing is done.
        let previously_unpinned = evictor.add_pinned_block(block_id);
        let result = self.commit_block_pinned(block_id).await;
        if !pin_on_create && previously_unpinned {
            evictor.remove_pinned_block(block_id);
        }
        drop(block_lock);
        result
    }

    /// Discard a temp block and notify listeners.
    ///
    /// # Errors
    /// Returns `NotFound` when no temp block exists, or the underlying
    /// delete error.
    pub async fn abort_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> BlockStoreResult<()> {
        debug!("abort_block: session_id={session_id}, block_id={block_id}");
        self.meta_store.abort_temp_block(block_id).await?;
        self.listeners.notify_each(|l| l.on_abort_block(block_id));
        Ok(())
    }

    /// Delete all pages of a committed block and notify listeners.
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` when the exclusive lock cannot be taken
    /// within the configured timeout, `NotFound` for an unknown block,
    /// `InvalidState` for a temp block.
    pub async fn remove_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> BlockStoreResult<()> {
        debug!("remove_block: session_id={session_id}, block_id={block_id}");
        let block_lock = self
            .lock_manager
            .try_acquire(
                session_id,
                block_id,
                BlockLockMode::Exclusive,
                self.remove_block_timeout,
            )
            .await?;
        let removed = self.meta_store.remove_block(block_id).await?;
        drop(block_lock);
        let location = BlockStoreLocation::new(self.tier.clone(), removed.dir().dir_index());
        self.listeners.notify_each(|l| {
            l.on_remove_block_by_client(block_id);
            l.on_remove_block(block_id, &location);
        });
        Ok(())
    }

    /// Notify listeners of a block access.
    pub async fn access_block(&self, block_id: BlockId) {
        if self.meta_store.has_block(block_id).await {
            self.listeners.notify_each(|l| l.on_access_block(block_id));
        }
    }

    /// Replace the pinned inode set.
    pub fn update_pinned_inodes(&self, inodes: HashSet<u64>) {
        debug!("update_pinned_inodes: inodes={inodes:?}");
        *self.pinned_inodes.lock() = inodes;
    }

    /// Whether the block is committed.
    pub async fn has_block_meta(&self, block_id: BlockId) -> bool {
        self.meta_store.has_block(block_id).await
    }

    /// Whether the block is a temp block.
    pub async fn has_temp_block_meta(&self, block_id: BlockId) -> bool {
        self.meta_store.has_temp_block(block_id).await
    }

    /// Snapshot used bytes, capacities and directory stats.
    pub async fn store_meta(&self) -> StoreMeta {
        self.meta_store.store_meta().await
    }

    /// Snapshot including the committed block list.
    pub async fn store_meta_full(&self) -> StoreMeta {
        self.meta_store.store_meta_full().await
    }

    /// Release every lock held by the session. Sessions keep no state
    /// beyond their outstanding locks.
    pub fn cleanup_session(&self, session_id: SessionId) {
        self.lock_manager.release_session(session_id);
    }

    /// The commit steps running while the block is pinned.
    async fn commit_block_pinned(&self, block_id: BlockId) -> BlockStoreResult<()> {
        let committed = self.meta_store.commit_temp_block(block_id).await?;
        let location = BlockStoreLocation::new(self.tier.clone(), committed.dir().dir_index());
        self.listeners
            .notify_each(|l| l.on_commit_block_to_local(block_id, &location));
        BLOCK_METRICS.block_commit_count_inc();
        self.commit_to_master_task(&committed, location).await
    }

    /// Build the future reporting one committed block to the master and
    /// notifying listeners afterwards. Used inline by `commit_block` and
    /// deferred to reader close by the caching miss path.
    fn commit_to_master_task(
        &self,
        meta: &Arc<PagedBlockMeta>,
        location: BlockStoreLocation,
    ) -> BoxFuture<'static, BlockStoreResult<()>> {
        let meta_store = Arc::clone(&self.meta_store);
        let pool = Arc::clone(&self.master_client_pool);
        let listeners = Arc::clone(&self.listeners);
        let worker_id = Arc::clone(&self.worker_id);
        let tier = self.tier.clone();
        let medium = self.medium.clone();
        let block_id = meta.block_id();
        let block_size = meta.block_size();
        async move {
            let used_bytes = meta_store.store_meta().await.used_bytes;
            let client = pool.acquire();
            client
                .commit_block(
                    worker_id.load(Ordering::Acquire),
                    used_bytes,
                    &tier,
                    &medium,
                    block_id,
                    block_size,
                )
                .await
                .map_err(|e| {
                    BlockStoreError::Unavailable(format!(
                        "failed to commit block {block_id} to master: {e}"
                    ))
                })?;
            listeners.notify_each(|l| l.on_commit_block_to_master(block_id, &location));
            Ok(())
        }
        .boxed()
    }

    /// A reader over a cached block, with the pin undo and lock release
    /// deferred to close.
    fn cached_block_reader(
        &self,
        meta: &Arc<PagedBlockMeta>,
        offset: u64,
        options: Option<OpenUfsBlockOptions>,
        block_lock: BlockLock,
        previously_unpinned: bool,
    ) -> BlockStoreResult<DelegatingBlockReader> {
        self.delegating_reader(meta, offset, options, block_lock, previously_unpinned, None)
    }

    /// Assemble the paged reader with its release hook and an optional
    /// master commit hook.
    fn delegating_reader(
        &self,
        meta: &Arc<PagedBlockMeta>,
        offset: u64,
        options: Option<OpenUfsBlockOptions>,
        block_lock: BlockLock,
        previously_unpinned: bool,
        commit_on_close: Option<BoxFuture<'static, BlockStoreResult<()>>>,
    ) -> BlockStoreResult<DelegatingBlockReader> {
        let block_id = meta.block_id();
        let evictor = meta.dir().evictor();
        let release: Box<dyn FnOnce() + Send> = Box::new(move || {
            if previously_unpinned {
                evictor.remove_pinned_block(block_id);
            }
            drop(block_lock);
        });
        if offset > meta.block_size() {
            // Undo the pin and the lock before surfacing the error.
            release();
            return Err(BlockStoreError::OutOfRange {
                maximum: meta.block_size(),
                found: offset,
            });
        }
        let ufs_reader = options.map(|opts| {
            PagedUfsBlockReader::new(
                Arc::clone(&self.ufs_stream_cache),
                Arc::clone(meta),
                opts,
                self.page_size,
            )
        });
        let inner = PagedBlockReader::new(Arc::clone(meta), self.page_size, ufs_reader);
        Ok(DelegatingBlockReader::new(
            Box::new(inner),
            commit_on_close,
            Some(release),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use async_trait::async_trait;

    use super::super::master::BlockMasterClient;
    use super::super::reader::BlockReader;
    use super::*;

    const PAGE_SIZE: u64 = 4096;

    /// Records master RPCs into the shared event log.
    struct RecordingMasterClient {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BlockMasterClient for RecordingMasterClient {
        async fn commit_block(
            &self,
            _worker_id: u64,
            used_bytes: u64,
            _tier: &str,
            _medium: &str,
            block_id: BlockId,
            length: u64,
        ) -> BlockStoreResult<()> {
            self.log
                .lock()
                .push(format!("rpc:{block_id}:{length}:{used_bytes}"));
            Ok(())
        }
    }

    /// Records listener events into the shared event log.
    struct RecordingListener {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl BlockStoreEventListener for RecordingListener {
        fn on_commit_block_to_local(&self, block_id: BlockId, _location: &BlockStoreLocation) {
            self.log.lock().push(format!("local:{block_id}"));
        }

        fn on_commit_block_to_master(&self, block_id: BlockId, _location: &BlockStoreLocation) {
            self.log.lock().push(format!("master:{block_id}"));
        }

        fn on_abort_block(&self, block_id: BlockId) {
            self.log.lock().push(format!("abort:{block_id}"));
        }

        fn on_access_block(&self, block_id: BlockId) {
            self.log.lock().push(format!("access:{block_id}"));
        }

        fn on_remove_block_by_client(&self, block_id: BlockId) {
            self.log.lock().push(format!("remove_client:{block_id}"));
        }

        fn on_remove_block(&self, block_id: BlockId, location: &BlockStoreLocation) {
            self.log
                .lock()
                .push(format!("remove:{block_id}:{}", location.dir_index));
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.block_store.page_size = PAGE_SIZE;
        config.block_store.remove_block_timeout_ms = 100;
        config
    }

    fn build_store(ufs: &UnderFileSystem, log: &Arc<Mutex<Vec<String>>>) -> PagedBlockStore {
        let dirs = vec![
            Arc::new(PagedBlockStoreDir::memory(0, 1 << 24).unwrap()),
            Arc::new(PagedBlockStoreDir::memory(1, 1 << 24).unwrap()),
        ];
        let meta_store = Arc::new(PagedBlockMetaStore::new(dirs));
        let master = Arc::new(RecordingMasterClient {
            log: Arc::clone(log),
        });
        let pool = Arc::new(BlockMasterClientPool::new(vec![master]));
        let store = PagedBlockStore::new(
            meta_store,
            pool,
            Arc::new(AtomicU64::new(1)),
            ufs.clone(),
            &test_config(),
        );
        store.register_block_store_event_listener(Arc::new(RecordingListener {
            log: Arc::clone(log),
        }));
        store
    }

    fn position_of(log: &[String], event: &str) -> usize {
        log.iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event} not in {log:?}"))
    }

    #[tokio::test]
    async fn test_create_write_commit_read() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        store
            .create_block(1, 42, &CreateBlockOptions { initial_bytes: 0 })
            .await
            .unwrap();
        let mut writer = store.create_block_writer(1, 42).await.unwrap();
        writer.append(&[1_u8; 4096]).await.unwrap();
        writer.append(&[2_u8; 4096]).await.unwrap();
        writer.append(&[3_u8; 1000]).await.unwrap();
        writer.close();

        store.commit_block(1, 42, false).await.unwrap();
        assert!(store.has_block_meta(42).await);
        assert!(!store.has_temp_block_meta(42).await);

        // Local commit precedes the master report, which precedes the
        // master commit event.
        {
            let events = log.lock().clone();
            let local = position_of(&events, "local:42");
            let rpc = position_of(&events, "rpc:42:9192:9192");
            let master = position_of(&events, "master:42");
            assert!(local < rpc && rpc < master);
        }

        let mut reader = store.create_block_reader(2, 42, 8000, None).await.unwrap();
        let bytes = reader.read(8000, 2000).await.unwrap();
        let mut expected = vec![2_u8; 192];
        expected.extend_from_slice(&[3_u8; 1000]);
        assert_eq!(bytes.as_ref(), &expected[..]);

        // The round trip over the whole block gives back the written bytes.
        let bytes = reader.read(0, 9192).await.unwrap();
        assert_eq!(bytes.len(), 9192);
        assert_eq!(&bytes[..4096], &[1_u8; 4096][..]);
        assert_eq!(&bytes[4096..8192], &[2_u8; 4096][..]);
        assert_eq!(&bytes[8192..], &[3_u8; 1000][..]);
        reader.close().await.unwrap();

        // The reader released its lock, so an exclusive removal goes
        // through within the timeout.
        store.remove_block(3, 42).await.unwrap();
        assert!(!store.has_block_meta(42).await);
    }

    #[tokio::test]
    async fn test_cache_miss_no_cache_keeps_block_unknown() {
        let ufs = UnderFileSystem::memory().unwrap();
        let content: Vec<u8> = (0..5000_u32).map(|i| (i % 256) as u8).collect();
        ufs.operator().write("/x", content.clone()).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let options = OpenUfsBlockOptions {
            ufs_path: "/x".to_owned(),
            offset_in_file: 0,
            block_size: 5000,
            no_cache: true,
        };
        let mut reader = store
            .create_block_reader(1, 7, 0, Some(options))
            .await
            .unwrap();
        let bytes = reader.read(0, 5000).await.unwrap();
        assert_eq!(bytes.as_ref(), &content[..]);
        reader.close().await.unwrap();

        assert!(!store.has_block_meta(7).await);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cache_miss_with_caching_commits_to_master() {
        let ufs = UnderFileSystem::memory().unwrap();
        let content: Vec<u8> = (0..5000_u32).map(|i| (i % 256) as u8).collect();
        ufs.operator().write("/x", content.clone()).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let options = OpenUfsBlockOptions {
            ufs_path: "/x".to_owned(),
            offset_in_file: 0,
            block_size: 5000,
            no_cache: false,
        };
        let mut reader = store
            .create_block_reader(1, 7, 0, Some(options))
            .await
            .unwrap();
        let bytes = reader.read(0, 5000).await.unwrap();
        assert_eq!(bytes.as_ref(), &content[..]);
        reader.close().await.unwrap();

        assert!(store.has_block_meta(7).await);
        let meta = store.meta_store().get_block(7).await.unwrap();
        // 5000 / 4096 rounded up gives pages 0 and 1.
        assert_eq!(meta.dir().block_pages(7).len(), 2);

        {
            let events = log.lock().clone();
            let rpc = position_of(&events, "rpc:7:5000:5000");
            let master = position_of(&events, "master:7");
            assert!(rpc < master);
        }

        // The reader undid its pin on close.
        assert!(meta.dir().evictor().add_pinned_block(7));
        meta.dir().evictor().remove_pinned_block(7);
    }

    #[tokio::test]
    async fn test_cache_miss_without_options_is_not_found() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);
        let err = store.create_block_reader(1, 11, 0, None).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_race_on_same_id() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let (first, second) = tokio::join!(
            store.create_block_writer(1, 77),
            store.create_block_writer(2, 77)
        );
        assert!(first.is_ok() != second.is_ok());
        let err = first.and(second).unwrap_err();
        assert!(matches!(err, BlockStoreError::AlreadyExists(77)));
    }

    #[tokio::test]
    async fn test_remove_block_times_out_under_reader() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let mut writer = store.create_block_writer(1, 9).await.unwrap();
        writer.append(&[5_u8; 100]).await.unwrap();
        store.commit_block(1, 9, false).await.unwrap();

        let lock = store.pin_block(2, 9).await.unwrap();
        let err = store.remove_block(3, 9).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::DeadlineExceeded(_)));
        assert!(store.has_block_meta(9).await);

        store.unpin_block(lock);
        store.remove_block(3, 9).await.unwrap();
        assert!(!store.has_block_meta(9).await);

        let events = log.lock().clone();
        assert!(events.contains(&"remove_client:9".to_owned()));
        assert!(events.iter().any(|e| e.starts_with("remove:9:")));
    }

    #[tokio::test]
    async fn test_remove_temp_block_is_invalid() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);
        store.create_block_writer(1, 13).await.unwrap();
        let err = store.remove_block(1, 13).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_abort_block() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let mut writer = store.create_block_writer(1, 21).await.unwrap();
        writer.append(&[1_u8; 50]).await.unwrap();
        store.abort_block(1, 21).await.unwrap();

        assert!(!store.has_temp_block_meta(21).await);
        assert!(log.lock().contains(&"abort:21".to_owned()));

        let err = store.commit_block(1, 21, false).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pin_unknown_block() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);
        assert!(store.pin_block(1, 99).await.is_none());
        // The shared lock was released, an exclusive acquisition succeeds.
        store.cleanup_session(1);
    }

    #[tokio::test]
    async fn test_access_block_notifies_only_known_blocks() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        store.access_block(5).await;
        assert!(log.lock().is_empty());

        let mut writer = store.create_block_writer(1, 5).await.unwrap();
        writer.append(&[0_u8; 10]).await.unwrap();
        store.commit_block(1, 5, false).await.unwrap();
        store.access_block(5).await;
        assert!(log.lock().contains(&"access:5".to_owned()));
    }

    #[tokio::test]
    async fn test_legacy_locked_reader_fails_not_found() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let mut writer = store.create_block_writer(1, 31).await.unwrap();
        writer.append(&[0_u8; 10]).await.unwrap();
        store.commit_block(1, 31, false).await.unwrap();

        let lock = store.pin_block(4, 31).await.unwrap();
        let err = store
            .create_block_reader_locked(4, 31, lock.lock_id())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));

        let err = store
            .create_block_reader_locked(5, 31, lock.lock_id())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockStoreError::InvalidState(_)));
        store.unpin_block(lock);
    }

    #[tokio::test]
    async fn test_reader_offset_out_of_range_releases_lock() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let mut writer = store.create_block_writer(1, 61).await.unwrap();
        writer.append(&[0_u8; 100]).await.unwrap();
        store.commit_block(1, 61, false).await.unwrap();

        let err = store
            .create_block_reader(2, 61, 1000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockStoreError::OutOfRange { .. }));

        // Pin and lock were undone, the block can be removed right away.
        store.remove_block(3, 61).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_pin_on_create_keeps_block_pinned() {
        let ufs = UnderFileSystem::memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = build_store(&ufs, &log);

        let mut writer = store.create_block_writer(1, 71).await.unwrap();
        writer.append(&[0_u8; 10]).await.unwrap();
        store.commit_block(1, 71, true).await.unwrap();

        let meta = store.meta_store().get_block(71).await.unwrap();
        // Still pinned from the commit, a fresh pin reports no transition.
        assert!(!meta.dir().evictor().add_pinned_block(71));
    }
}
