//! A cache directory holding pages behind an `openDAL` operator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use clippy_utilities::NumericCast;
use opendal::services::{Fs, Memory};
use opendal::{ErrorKind, Operator};
use parking_lot::Mutex;
use tracing::debug;

use super::error::{BlockStoreError, BlockStoreResult};
use super::evictor::{Evictor, LruEvictor};
use super::id::{block_file_id, temp_file_id, BlockId, PageId};

/// Formats a page path string given the file id and page index.
///
/// The page path is formatted as `{file_id}/{page_index}`.
#[must_use]
#[inline]
fn page_path(file_id: &str, page_index: u64) -> String {
    format!("{file_id}/{page_index}")
}

/// The pages of a committed block within one directory.
#[derive(Debug, Default)]
struct CommittedFile {
    /// The file id holding the pages.
    file_id: String,
    /// Page index to page size.
    pages: BTreeMap<u64, u64>,
}

/// The mutable bookkeeping of a directory.
#[derive(Debug, Default)]
struct DirInner {
    /// Reserved bytes per file id, idempotent by file id.
    reservations: HashMap<String, u64>,
    /// Pending temp file ids.
    temp_files: HashSet<String>,
    /// Temp file id to (page index to page size).
    temp_pages: HashMap<String, BTreeMap<u64, u64>>,
    /// Committed pages per block.
    committed: HashMap<BlockId, CommittedFile>,
    /// Total bytes of committed pages.
    cached_bytes: u64,
}

impl DirInner {
    /// Total bytes of temp pages.
    fn temp_bytes(&self) -> u64 {
        self.temp_pages
            .values()
            .flat_map(BTreeMap::values)
            .sum()
    }

    /// Total reserved bytes.
    fn reserved_bytes(&self) -> u64 {
        self.reservations.values().sum()
    }
}

/// A page store directory: opaque byte storage addressed by page id, with
/// capacity accounting and a per-directory evictor.
pub struct PagedBlockStoreDir {
    /// The index of this directory, stable for the process lifetime.
    index: u32,
    /// The capacity of this directory in bytes.
    capacity: u64,
    /// The inner operator storing page bytes.
    operator: Operator,
    /// The evictor of this directory.
    evictor: Arc<dyn Evictor>,
    /// The bookkeeping of pages and reservations.
    inner: Mutex<DirInner>,
}

impl std::fmt::Debug for PagedBlockStoreDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedBlockStoreDir")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl PagedBlockStoreDir {
    /// Creates a new `PagedBlockStoreDir` over the given operator.
    #[must_use]
    pub fn new(index: u32, capacity: u64, operator: Operator) -> Self {
        Self {
            index,
            capacity,
            operator,
            evictor: Arc::new(LruEvictor::new()),
            inner: Mutex::new(DirInner::default()),
        }
    }

    /// Creates a directory backed by a memory operator.
    ///
    /// # Errors
    /// Returns an error when the operator cannot be built.
    pub fn memory(index: u32, capacity: u64) -> BlockStoreResult<Self> {
        let op = Operator::new(Memory::default())?.finish();
        Ok(Self::new(index, capacity, op))
    }

    /// Creates a directory backed by a file system operator rooted at `root`.
    ///
    /// # Errors
    /// Returns an error when the operator cannot be built.
    pub fn file_system(index: u32, capacity: u64, root: &str) -> BlockStoreResult<Self> {
        let mut builder = Fs::default();
        builder.root(root);
        let op = Operator::new(builder)?.finish();
        Ok(Self::new(index, capacity, op))
    }

    /// The index of this directory.
    #[must_use]
    pub fn dir_index(&self) -> u32 {
        self.index
    }

    /// The capacity of this directory in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total bytes of committed pages in this directory.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.inner.lock().cached_bytes
    }

    /// The evictor of this directory.
    #[must_use]
    pub fn evictor(&self) -> Arc<dyn Evictor> {
        Arc::clone(&self.evictor)
    }

    /// Whether this directory holds a reservation under `file_id`.
    #[must_use]
    pub fn has_reservation(&self, file_id: &str) -> bool {
        self.inner.lock().reservations.contains_key(file_id)
    }

    /// Reserve `bytes` of capacity under `file_id`, idempotent by file id.
    /// Returns `false` when the directory cannot fit the reservation.
    pub fn reserve(&self, file_id: &str, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.reservations.contains_key(file_id) {
            return true;
        }
        let used = inner
            .cached_bytes
            .saturating_add(inner.temp_bytes())
            .saturating_add(inner.reserved_bytes());
        if used.saturating_add(bytes) > self.capacity {
            return false;
        }
        inner.reservations.insert(file_id.to_owned(), bytes);
        true
    }

    /// Register a pending temp file.
    pub fn put_temp_file(&self, file_id: &str) {
        let mut inner = self.inner.lock();
        inner.temp_files.insert(file_id.to_owned());
        inner.temp_pages.entry(file_id.to_owned()).or_default();
    }

    /// Write one page of a temp file and record its size.
    ///
    /// # Errors
    /// Returns `InvalidState` when the temp file is unknown, or the
    /// underlying write error.
    pub async fn write_temp_page(
        &self,
        file_id: &str,
        page_index: u64,
        data: Bytes,
    ) -> BlockStoreResult<()> {
        if !self.inner.lock().temp_files.contains(file_id) {
            return Err(BlockStoreError::InvalidState(format!(
                "temp file {file_id} is not registered in dir {}",
                self.index
            )));
        }
        let len: u64 = data.len().numeric_cast();
        self.operator
            .write(&page_path(file_id, page_index), data)
            .await?;
        let mut inner = self.inner.lock();
        inner
            .temp_pages
            .entry(file_id.to_owned())
            .or_default()
            .insert(page_index, len);
        Ok(())
    }

    /// Write one page of a committed block, registering it in the page set.
    /// Overwriting an already cached page is a no-op for the accounting.
    ///
    /// # Errors
    /// Returns the underlying write error.
    pub async fn write_page(
        &self,
        block_id: BlockId,
        block_size: u64,
        page_index: u64,
        data: Bytes,
    ) -> BlockStoreResult<()> {
        let file_id = block_file_id(block_id, block_size);
        let len: u64 = data.len().numeric_cast();
        self.operator
            .write(&page_path(&file_id, page_index), data)
            .await?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let committed = inner.committed.entry(block_id).or_insert_with(|| CommittedFile {
            file_id: file_id.clone(),
            pages: BTreeMap::new(),
        });
        if committed.pages.insert(page_index, len).is_none() {
            inner.cached_bytes = inner.cached_bytes.saturating_add(len);
        }
        drop(guard);
        self.evictor.update_on_put(&PageId::new(file_id, page_index));
        Ok(())
    }

    /// Read one page, or `None` if the page is not cached in this directory.
    ///
    /// # Errors
    /// Returns the underlying read error.
    pub async fn read_page(&self, page_id: &PageId) -> BlockStoreResult<Option<Bytes>> {
        let registered = {
            let inner = self.inner.lock();
            inner
                .committed
                .values()
                .any(|file| file.file_id == page_id.file_id && file.pages.contains_key(&page_id.page_index))
                || inner
                    .temp_pages
                    .get(&page_id.file_id)
                    .is_some_and(|pages| pages.contains_key(&page_id.page_index))
        };
        if !registered {
            return Ok(None);
        }
        match self
            .operator
            .read(&page_path(&page_id.file_id, page_id.page_index))
            .await
        {
            Ok(data) => {
                self.evictor.update_on_get(page_id);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Promote the pages of `temp_file_id` to `final_file_id` by renaming
    /// them in place, and move the bookkeeping from temp to committed.
    /// The cost is proportional to the number of pages, not their bytes.
    ///
    /// # Errors
    /// Returns `InvalidState` when the temp file is unknown, or the
    /// underlying rename error.
    pub async fn commit(
        &self,
        temp_file_id: &str,
        final_file_id: &str,
        block_id: BlockId,
    ) -> BlockStoreResult<u64> {
        let pages = {
            let inner = self.inner.lock();
            if !inner.temp_files.contains(temp_file_id) {
                return Err(BlockStoreError::InvalidState(format!(
                    "temp file {temp_file_id} is not registered in dir {}",
                    self.index
                )));
            }
            inner
                .temp_pages
                .get(temp_file_id)
                .cloned()
                .unwrap_or_default()
        };

        for &page_index in pages.keys() {
            let from = page_path(temp_file_id, page_index);
            let to = page_path(final_file_id, page_index);
            match self.operator.rename(&from, &to).await {
                Ok(()) => {}
                // Stores without native rename fall back to copy and delete.
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    let data = self.operator.read(&from).await?;
                    self.operator.write(&to, data).await?;
                    self.operator.delete(&from).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let total: u64 = pages.values().sum();
        let mut inner = self.inner.lock();
        inner.temp_files.remove(temp_file_id);
        inner.temp_pages.remove(temp_file_id);
        inner.reservations.remove(temp_file_id);
        inner.committed.insert(
            block_id,
            CommittedFile {
                file_id: final_file_id.to_owned(),
                pages: pages.clone(),
            },
        );
        inner.cached_bytes = inner.cached_bytes.saturating_add(total);
        drop(inner);
        for &page_index in pages.keys() {
            self.evictor
                .update_on_put(&PageId::new(final_file_id, page_index));
        }
        debug!(
            "dir {}: committed {} pages of block {} as {}",
            self.index,
            pages.len(),
            block_id,
            final_file_id
        );
        Ok(total)
    }

    /// Discard the pages of a temp file.
    ///
    /// # Errors
    /// Returns `InvalidState` when the temp file is unknown, or the
    /// underlying delete error.
    pub async fn abort(&self, temp_file_id: &str) -> BlockStoreResult<()> {
        let pages = {
            let inner = self.inner.lock();
            if !inner.temp_files.contains(temp_file_id) {
                return Err(BlockStoreError::InvalidState(format!(
                    "temp file {temp_file_id} is not registered in dir {}",
                    self.index
                )));
            }
            inner
                .temp_pages
                .get(temp_file_id)
                .cloned()
                .unwrap_or_default()
        };
        for &page_index in pages.keys() {
            self.operator
                .delete(&page_path(temp_file_id, page_index))
                .await?;
        }
        let mut inner = self.inner.lock();
        inner.temp_files.remove(temp_file_id);
        inner.temp_pages.remove(temp_file_id);
        inner.reservations.remove(temp_file_id);
        Ok(())
    }

    /// Delete one committed page and unregister it.
    /// Returns the size of the deleted page.
    ///
    /// # Errors
    /// Returns `NotFound` when the page is not registered here, or the
    /// underlying delete error.
    pub async fn delete_page(&self, page_id: &PageId) -> BlockStoreResult<u64> {
        let size = {
            let inner = self.inner.lock();
            let Some((_, file)) = inner
                .committed
                .iter()
                .find(|(_, file)| file.file_id == page_id.file_id)
            else {
                return Err(BlockStoreError::NotFound(format!(
                    "page {}/{}",
                    page_id.file_id, page_id.page_index
                )));
            };
            let Some(&size) = file.pages.get(&page_id.page_index) else {
                return Err(BlockStoreError::NotFound(format!(
                    "page {}/{}",
                    page_id.file_id, page_id.page_index
                )));
            };
            size
        };
        self.operator
            .delete(&page_path(&page_id.file_id, page_id.page_index))
            .await?;
        let mut inner = self.inner.lock();
        let mut emptied = None;
        if let Some((&block_id, file)) = inner
            .committed
            .iter_mut()
            .find(|(_, file)| file.file_id == page_id.file_id)
        {
            file.pages.remove(&page_id.page_index);
            if file.pages.is_empty() {
                emptied = Some(block_id);
            }
        }
        if let Some(block_id) = emptied {
            inner.committed.remove(&block_id);
        }
        inner.cached_bytes = inner.cached_bytes.saturating_sub(size);
        drop(inner);
        self.evictor.update_on_delete(page_id);
        Ok(size)
    }

    /// Whether this directory holds the given page.
    #[must_use]
    pub fn has_page(&self, page_id: &PageId) -> bool {
        self.inner
            .lock()
            .committed
            .values()
            .any(|file| file.file_id == page_id.file_id && file.pages.contains_key(&page_id.page_index))
    }

    /// All cached pages of a block in this directory.
    #[must_use]
    pub fn block_pages(&self, block_id: BlockId) -> Vec<PageId> {
        self.inner
            .lock()
            .committed
            .get(&block_id)
            .map(|file| {
                file.pages
                    .keys()
                    .map(|&index| PageId::new(file.file_id.clone(), index))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bytes written so far into the temp file of a block.
    #[must_use]
    pub fn temp_block_cached_bytes(&self, block_id: BlockId) -> u64 {
        self.inner
            .lock()
            .temp_pages
            .get(&temp_file_id(block_id))
            .map(|pages| pages.values().sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_page_round_trip() {
        let dir = PagedBlockStoreDir::memory(0, 1 << 20).unwrap();
        let temp_id = temp_file_id(7);
        assert!(dir.reserve(&temp_id, 0));
        dir.put_temp_file(&temp_id);

        dir.write_temp_page(&temp_id, 0, Bytes::from(vec![1_u8; 4096]))
            .await
            .unwrap();
        dir.write_temp_page(&temp_id, 1, Bytes::from(vec![2_u8; 100]))
            .await
            .unwrap();
        assert_eq!(dir.temp_block_cached_bytes(7), 4196);

        let final_id = block_file_id(7, 4196);
        let committed = dir.commit(&temp_id, &final_id, 7).await.unwrap();
        assert_eq!(committed, 4196);
        assert_eq!(dir.temp_block_cached_bytes(7), 0);
        assert_eq!(dir.cached_bytes(), 4196);
        assert_eq!(dir.block_pages(7).len(), 2);

        let page = dir
            .read_page(&PageId::new(final_id.clone(), 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.as_ref(), &[2_u8; 100]);
    }

    #[tokio::test]
    async fn test_abort_discards_pages() {
        let dir = PagedBlockStoreDir::memory(0, 1 << 20).unwrap();
        let temp_id = temp_file_id(9);
        dir.put_temp_file(&temp_id);
        dir.write_temp_page(&temp_id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        dir.abort(&temp_id).await.unwrap();
        assert_eq!(dir.temp_block_cached_bytes(9), 0);
        assert!(dir
            .read_page(&PageId::new(temp_id.clone(), 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity() {
        let dir = PagedBlockStoreDir::memory(0, 100).unwrap();
        assert!(dir.reserve("a", 80));
        // Idempotent for the same file id.
        assert!(dir.reserve("a", 80));
        assert!(!dir.reserve("b", 30));
        assert!(dir.reserve("c", 20));
    }

    #[tokio::test]
    async fn test_fs_dir_commit_renames_pages() {
        let root = tempfile::tempdir().unwrap();
        let dir = PagedBlockStoreDir::file_system(
            0,
            1 << 20,
            root.path().to_str().unwrap(),
        )
        .unwrap();
        let temp_id = temp_file_id(5);
        dir.put_temp_file(&temp_id);
        dir.write_temp_page(&temp_id, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let final_id = block_file_id(5, 5);
        dir.commit(&temp_id, &final_id, 5).await.unwrap();

        let page = dir
            .read_page(&PageId::new(final_id, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.as_ref(), b"hello");
        assert!(dir
            .read_page(&PageId::new(temp_id, 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_page_accounting() {
        let dir = PagedBlockStoreDir::memory(0, 1 << 20).unwrap();
        dir.write_page(3, 5000, 0, Bytes::from(vec![0_u8; 4096]))
            .await
            .unwrap();
        dir.write_page(3, 5000, 1, Bytes::from(vec![0_u8; 904]))
            .await
            .unwrap();
        assert_eq!(dir.cached_bytes(), 5000);

        let file_id = block_file_id(3, 5000);
        let removed = dir.delete_page(&PageId::new(file_id.clone(), 0)).await.unwrap();
        assert_eq!(removed, 4096);
        assert_eq!(dir.cached_bytes(), 904);

        let err = dir.delete_page(&PageId::new(file_id, 0)).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));
    }
}
