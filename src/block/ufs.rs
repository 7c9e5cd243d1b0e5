//! The underlying file system (UFS) seam.
//!
//! The UFS is the authoritative source of block bytes on cache miss. Reads
//! go through a cache of open positioned streams so that sequential page
//! fetches over the same file reuse one stream.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::{AsyncReadExt, AsyncSeekExt};
use hashlink::LinkedHashMap;
use opendal::services::{Fs, Memory};
use opendal::{ErrorKind, Operator};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{BlockStoreError, BlockStoreResult};

/// How many open UFS streams to keep around.
const STREAM_CACHE_CAPACITY: usize = 64;

/// The status of one UFS file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsFileStatus {
    /// The path of the file in the cache namespace.
    pub path: String,
    /// The path of the file on the UFS.
    pub ufs_path: String,
    /// The length of the file in bytes.
    pub length: u64,
}

/// An underlying file system behind an `openDAL` operator.
#[derive(Debug, Clone)]
pub struct UnderFileSystem {
    /// The inner operator.
    operator: Operator,
}

impl UnderFileSystem {
    /// Creates a new `UnderFileSystem` over the given operator.
    #[must_use]
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    /// Creates a UFS backed by the local file system rooted at `root`.
    ///
    /// # Errors
    /// Returns an error when the operator cannot be built.
    pub fn file_system(root: &str) -> BlockStoreResult<Self> {
        let mut builder = Fs::default();
        builder.root(root);
        Ok(Self::new(Operator::new(builder)?.finish()))
    }

    /// Creates an in-memory UFS.
    ///
    /// # Errors
    /// Returns an error when the operator cannot be built.
    pub fn memory() -> BlockStoreResult<Self> {
        Ok(Self::new(Operator::new(Memory::default())?.finish()))
    }

    /// The inner operator.
    #[must_use]
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// Stat one file.
    ///
    /// # Errors
    /// Returns `NotFound` when the path does not exist.
    pub async fn get_status(&self, path: &str) -> BlockStoreResult<UfsFileStatus> {
        match self.operator.stat(path).await {
            Ok(meta) => Ok(UfsFileStatus {
                path: path.to_owned(),
                ufs_path: path.to_owned(),
                length: meta.content_length(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BlockStoreError::NotFound(format!("file {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List every file under `path` recursively.
    ///
    /// # Errors
    /// Returns the underlying listing error.
    pub async fn list_status(&self, path: &str) -> BlockStoreResult<Vec<UfsFileStatus>> {
        let entries = self.operator.list_with(path).recursive(true).await?;
        let mut statuses = Vec::new();
        for entry in entries {
            let meta = self.operator.stat(entry.path()).await?;
            if meta.mode().is_file() {
                statuses.push(UfsFileStatus {
                    path: entry.path().to_owned(),
                    ufs_path: entry.path().to_owned(),
                    length: meta.content_length(),
                });
            }
        }
        Ok(statuses)
    }
}

/// A cache of open positioned input streams keyed by UFS path.
pub struct UfsInputStreamCache {
    /// The UFS the streams read from.
    ufs: UnderFileSystem,
    /// Open streams in access order, least recent in front.
    streams: Mutex<LinkedHashMap<String, Arc<tokio::sync::Mutex<opendal::Reader>>>>,
    /// How many streams to keep open.
    capacity: usize,
}

impl std::fmt::Debug for UfsInputStreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UfsInputStreamCache")
            .field("streams", &self.streams.lock().len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl UfsInputStreamCache {
    /// Creates a new `UfsInputStreamCache`.
    #[must_use]
    pub fn new(ufs: UnderFileSystem) -> Self {
        Self {
            ufs,
            streams: Mutex::new(LinkedHashMap::new()),
            capacity: STREAM_CACHE_CAPACITY,
        }
    }

    /// The UFS the streams read from.
    #[must_use]
    pub fn ufs(&self) -> &UnderFileSystem {
        &self.ufs
    }

    /// Read up to `buf.len()` bytes at `offset` of `path`, returning how
    /// many bytes were read. A short count means end of file.
    ///
    /// # Errors
    /// Returns the underlying open, seek or read error.
    pub async fn read_at(
        &self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> BlockStoreResult<usize> {
        let stream = self.take_stream(path).await?;
        let mut reader = stream.lock().await;
        reader.seek(SeekFrom::Start(offset)).await?;
        let len = buf.len();
        let mut read_size = 0;
        while read_size < len {
            let chunk = buf
                .get_mut(read_size..len)
                .unwrap_or_else(|| unreachable!("The `buf` is ensured to be long enough."));
            let size = reader.read(chunk).await?;
            if size == 0 {
                break;
            }
            read_size += size;
        }
        Ok(read_size)
    }

    /// Fetch the cached stream of `path`, opening one on first use, and
    /// evict the least recently used stream beyond the capacity.
    async fn take_stream(
        &self,
        path: &str,
    ) -> BlockStoreResult<Arc<tokio::sync::Mutex<opendal::Reader>>> {
        {
            let mut streams = self.streams.lock();
            if let Some(stream) = streams.to_back(path) {
                return Ok(Arc::clone(stream));
            }
        }
        let reader = self.ufs.operator().reader(path).await?;
        let stream = Arc::new(tokio::sync::Mutex::new(reader));
        let mut streams = self.streams.lock();
        streams.insert(path.to_owned(), Arc::clone(&stream));
        while streams.len() > self.capacity {
            streams.pop_front();
        }
        Ok(stream)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_at() {
        let ufs = UnderFileSystem::memory().unwrap();
        ufs.operator().write("/x", b"hello paged world".to_vec()).await.unwrap();

        let cache = UfsInputStreamCache::new(ufs);
        let mut buf = vec![0_u8; 5];
        let n = cache.read_at("/x", 6, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"paged");

        // Reads past the end return a short count.
        let n = cache.read_at("/x", 12, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        let n = cache.read_at("/x", 17, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let ufs = UnderFileSystem::memory().unwrap();
        let err = ufs.get_status("/missing").await.unwrap_err();
        assert!(matches!(err, BlockStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_status() {
        let ufs = UnderFileSystem::memory().unwrap();
        ufs.operator().write("/dir/a", vec![0_u8; 10]).await.unwrap();
        ufs.operator().write("/dir/sub/b", vec![0_u8; 20]).await.unwrap();

        let mut statuses = ufs.list_status("/dir/").await.unwrap();
        statuses.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].length, 10);
        assert_eq!(statuses[1].length, 20);
    }
}
