//! The paged block writer.

use std::sync::Arc;

use bytes::Bytes;
use clippy_utilities::NumericCast;

use super::error::{BlockStoreError, BlockStoreResult};
use super::id::temp_file_id;
use super::meta::PagedTempBlockMeta;

/// A writer streaming sequential pages into the temp file of a block.
///
/// Writes are appended page by page; every page is full except possibly the
/// last one, which seals the writer. The temp-bytes counter of the owning
/// directory is updated atomically per page.
#[derive(Debug)]
pub struct PagedBlockWriter {
    /// The temp block being written.
    temp_meta: Arc<PagedTempBlockMeta>,
    /// The page size of the store.
    page_size: u64,
    /// The append position, page aligned until the writer is sealed.
    position: u64,
    /// Set when a short page was appended.
    sealed: bool,
    /// Whether the writer was closed.
    closed: bool,
}

impl PagedBlockWriter {
    /// Creates a new `PagedBlockWriter`.
    #[must_use]
    pub fn new(temp_meta: Arc<PagedTempBlockMeta>, page_size: u64) -> Self {
        Self {
            temp_meta,
            page_size,
            position: 0,
            sealed: false,
            closed: false,
        }
    }

    /// Bytes appended so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append `data` to the temp block, splitting it into pages.
    /// Returns the new append position.
    ///
    /// # Errors
    /// Returns `InvalidState` when the writer is closed or was sealed by a
    /// short page, or the underlying write error.
    pub async fn append(&mut self, data: &[u8]) -> BlockStoreResult<u64> {
        if self.closed {
            return Err(BlockStoreError::InvalidState(format!(
                "writer of block {} is closed",
                self.temp_meta.block_id()
            )));
        }
        let file_id = temp_file_id(self.temp_meta.block_id());
        for chunk in data.chunks(self.page_size.numeric_cast()) {
            if self.sealed {
                return Err(BlockStoreError::InvalidState(format!(
                    "block {} already ends with a short page",
                    self.temp_meta.block_id()
                )));
            }
            let page_index = self.position / self.page_size;
            self.temp_meta
                .dir()
                .write_temp_page(&file_id, page_index, Bytes::copy_from_slice(chunk))
                .await?;
            let len: u64 = chunk.len().numeric_cast();
            self.position += len;
            self.temp_meta.set_block_size(self.position);
            if len < self.page_size {
                self.sealed = true;
            }
        }
        Ok(self.position)
    }

    /// Close the writer. Closing more than once is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::dir::PagedBlockStoreDir;
    use super::*;

    const PAGE_SIZE: u64 = 4096;

    fn temp_block(block_id: u64) -> Arc<PagedTempBlockMeta> {
        let dir = Arc::new(PagedBlockStoreDir::memory(0, 1 << 20).unwrap());
        dir.put_temp_file(&temp_file_id(block_id));
        Arc::new(PagedTempBlockMeta::new(block_id, dir))
    }

    #[tokio::test]
    async fn test_append_pages() {
        let temp = temp_block(42);
        let mut writer = PagedBlockWriter::new(Arc::clone(&temp), PAGE_SIZE);

        writer.append(&[1_u8; 4096]).await.unwrap();
        writer.append(&[2_u8; 4096]).await.unwrap();
        let position = writer.append(&[3_u8; 1000]).await.unwrap();
        assert_eq!(position, 9192);
        assert_eq!(temp.block_size(), 9192);
        assert_eq!(temp.dir().temp_block_cached_bytes(42), 9192);
    }

    #[tokio::test]
    async fn test_append_splits_large_buffers() {
        let temp = temp_block(43);
        let mut writer = PagedBlockWriter::new(Arc::clone(&temp), PAGE_SIZE);

        writer.append(&[0_u8; 8192 + 100]).await.unwrap();
        assert_eq!(temp.dir().temp_block_cached_bytes(43), 8292);

        // The trailing short page sealed the writer.
        let err = writer.append(&[0_u8; 10]).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_append_after_close() {
        let temp = temp_block(44);
        let mut writer = PagedBlockWriter::new(temp, PAGE_SIZE);
        writer.close();
        writer.close();
        let err = writer.append(&[0_u8; 10]).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::InvalidState(_)));
    }
}
