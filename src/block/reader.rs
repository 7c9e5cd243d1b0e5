//! Cache-aware block readers.
//!
//! A `PagedBlockReader` serves block bytes page by page from the local page
//! store and fills the gaps from the UFS. A `PagedUfsBlockReader` reads from
//! the UFS only. A `DelegatingBlockReader` attaches the release work that
//! must happen exactly once when the client is done reading.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clippy_utilities::NumericCast;
use futures::future::BoxFuture;
use tracing::warn;

use super::error::{BlockStoreError, BlockStoreResult};
use super::id::{block_file_id, offset_to_slices, PageId};
use super::meta::PagedBlockMeta;
use super::ufs::UfsInputStreamCache;
use crate::metrics::BLOCK_METRICS;

/// How to reach the bytes of a block on the UFS.
#[derive(Debug, Clone)]
pub struct OpenUfsBlockOptions {
    /// The path of the file holding the block on the UFS.
    pub ufs_path: String,
    /// The position of the first byte of the block within the UFS file.
    pub offset_in_file: u64,
    /// The length of the block.
    pub block_size: u64,
    /// Skip populating the cache while reading.
    pub no_cache: bool,
}

/// A positioned reader over one block. Single consumer.
#[async_trait]
pub trait BlockReader: Send {
    /// Read up to `length` bytes starting at `offset` within the block.
    /// The returned buffer is shorter than `length` at the end of block.
    async fn read(&mut self, offset: u64, length: u64) -> BlockStoreResult<Bytes>;

    /// The length of the block.
    fn block_size(&self) -> u64;

    /// Close the reader. Closing more than once is a no-op.
    async fn close(&mut self) -> BlockStoreResult<()>;
}

/// A reader that streams a block from the UFS, one page at a time.
#[derive(Debug)]
pub struct PagedUfsBlockReader {
    /// The cache of open UFS streams.
    stream_cache: Arc<UfsInputStreamCache>,
    /// The block being read.
    block_meta: Arc<PagedBlockMeta>,
    /// Where the block lives on the UFS.
    options: OpenUfsBlockOptions,
    /// The page size of the store.
    page_size: u64,
    /// The last fetched page, kept so that sub-page reads do not refetch.
    last_page: Option<(u64, Bytes)>,
    /// Whether the reader was closed.
    closed: bool,
}

impl PagedUfsBlockReader {
    /// Creates a new `PagedUfsBlockReader`.
    #[must_use]
    pub fn new(
        stream_cache: Arc<UfsInputStreamCache>,
        block_meta: Arc<PagedBlockMeta>,
        options: OpenUfsBlockOptions,
        page_size: u64,
    ) -> Self {
        Self {
            stream_cache,
            block_meta,
            options,
            page_size,
            last_page: None,
            closed: false,
        }
    }

    /// Fetch one whole page from the UFS. The last page may be short.
    ///
    /// # Errors
    /// Returns `OutOfRange` for a page beyond the block, `Internal` when
    /// the UFS holds fewer bytes than the block declares.
    pub async fn read_page(&mut self, page_index: u64) -> BlockStoreResult<Bytes> {
        if let Some((index, ref page)) = self.last_page {
            if index == page_index {
                return Ok(page.clone());
            }
        }
        let block_size = self.block_meta.block_size();
        let position = page_index.saturating_mul(self.page_size);
        if position >= block_size {
            return Err(BlockStoreError::OutOfRange {
                maximum: block_size,
                found: position,
            });
        }
        let length = self.page_size.min(block_size - position);
        let mut buf = vec![0_u8; length.numeric_cast()];
        let read_size = self
            .stream_cache
            .read_at(
                &self.options.ufs_path,
                self.options.offset_in_file + position,
                &mut buf,
            )
            .await?;
        if read_size.numeric_cast::<u64>() < length {
            return Err(BlockStoreError::Internal(anyhow!(
                "UFS file {} ended after {read_size} bytes of page {page_index}, expected {length}",
                self.options.ufs_path
            )));
        }
        let page = Bytes::from(buf);
        self.last_page = Some((page_index, page.clone()));
        Ok(page)
    }
}

#[async_trait]
impl BlockReader for PagedUfsBlockReader {
    async fn read(&mut self, offset: u64, length: u64) -> BlockStoreResult<Bytes> {
        let block_size = self.block_meta.block_size();
        let slices = offset_to_slices(self.page_size, block_size, offset, length);
        let mut out = BytesMut::with_capacity(length.min(block_size).numeric_cast());
        for slice in slices {
            let page = self.read_page(slice.page_index).await?;
            let start: usize = slice.offset.numeric_cast();
            let end: usize = (slice.offset + slice.size).numeric_cast();
            let chunk = page.get(start..end).ok_or_else(|| {
                BlockStoreError::Internal(anyhow!(
                    "page {} of block {} is shorter than expected",
                    slice.page_index,
                    self.block_meta.block_id()
                ))
            })?;
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    fn block_size(&self) -> u64 {
        self.block_meta.block_size()
    }

    async fn close(&mut self) -> BlockStoreResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// A reader that serves pages from the local page store, filling misses
/// from the UFS and caching each filled page.
#[derive(Debug)]
pub struct PagedBlockReader {
    /// The block being read.
    block_meta: Arc<PagedBlockMeta>,
    /// The page size of the store.
    page_size: u64,
    /// The fallback UFS reader, absent for purely local blocks.
    ufs_reader: Option<PagedUfsBlockReader>,
    /// Whether the reader was closed.
    closed: bool,
}

impl PagedBlockReader {
    /// Creates a new `PagedBlockReader`.
    #[must_use]
    pub fn new(
        block_meta: Arc<PagedBlockMeta>,
        page_size: u64,
        ufs_reader: Option<PagedUfsBlockReader>,
    ) -> Self {
        Self {
            block_meta,
            page_size,
            ufs_reader,
            closed: false,
        }
    }
}

#[async_trait]
impl BlockReader for PagedBlockReader {
    async fn read(&mut self, offset: u64, length: u64) -> BlockStoreResult<Bytes> {
        let block_id = self.block_meta.block_id();
        let block_size = self.block_meta.block_size();
        let file_id = block_file_id(block_id, block_size);
        let dir = Arc::clone(self.block_meta.dir());

        let slices = offset_to_slices(self.page_size, block_size, offset, length);
        let mut out = BytesMut::with_capacity(length.min(block_size).numeric_cast());
        for slice in slices {
            let page_id = PageId::new(file_id.clone(), slice.page_index);
            let page = match dir.read_page(&page_id).await? {
                Some(page) => {
                    BLOCK_METRICS.page_hit_count_inc();
                    page
                }
                None => {
                    BLOCK_METRICS.page_miss_count_inc();
                    let ufs_reader = self.ufs_reader.as_mut().ok_or_else(|| {
                        BlockStoreError::NotFound(format!(
                            "page {} of block {block_id}, and no UFS fallback",
                            slice.page_index
                        ))
                    })?;
                    let page = ufs_reader.read_page(slice.page_index).await?;
                    dir.write_page(block_id, block_size, slice.page_index, page.clone())
                        .await?;
                    page
                }
            };
            let start: usize = slice.offset.numeric_cast();
            let end: usize = (slice.offset + slice.size).numeric_cast();
            let chunk = page.get(start..end).ok_or_else(|| {
                BlockStoreError::Internal(anyhow!(
                    "page {} of block {block_id} is shorter than expected",
                    slice.page_index
                ))
            })?;
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    fn block_size(&self) -> u64 {
        self.block_meta.block_size()
    }

    async fn close(&mut self) -> BlockStoreResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// A reader wrapping another reader with deferred release work.
///
/// The release hook (pin decrement and lock release) runs exactly once, on
/// close or on drop, on every exit path. The optional commit hook (report
/// to master) runs on an explicit close only.
pub struct DelegatingBlockReader {
    /// The wrapped reader.
    inner: Box<dyn BlockReader>,
    /// Reported to the master once the client is done reading.
    commit_on_close: Option<BoxFuture<'static, BlockStoreResult<()>>>,
    /// Pin decrement and lock release.
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for DelegatingBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingBlockReader")
            .field("block_size", &self.inner.block_size())
            .field("commit_on_close", &self.commit_on_close.is_some())
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl DelegatingBlockReader {
    /// Creates a new `DelegatingBlockReader`.
    #[must_use]
    pub fn new(
        inner: Box<dyn BlockReader>,
        commit_on_close: Option<BoxFuture<'static, BlockStoreResult<()>>>,
        release: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            inner,
            commit_on_close,
            release,
        }
    }
}

#[async_trait]
impl BlockReader for DelegatingBlockReader {
    async fn read(&mut self, offset: u64, length: u64) -> BlockStoreResult<Bytes> {
        self.inner.read(offset, length).await
    }

    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }

    async fn close(&mut self) -> BlockStoreResult<()> {
        let close_result = self.inner.close().await;
        let commit_result = match self.commit_on_close.take() {
            Some(commit) => commit.await,
            None => Ok(()),
        };
        if let Some(release) = self.release.take() {
            release();
        }
        close_result.and(commit_result)
    }
}

impl Drop for DelegatingBlockReader {
    fn drop(&mut self) {
        if self.commit_on_close.is_some() {
            warn!("a block reader was dropped without close, skipping the master report");
        }
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
