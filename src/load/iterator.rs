//! Lazy file listing for the load job.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::error::BlockStoreResult;
use crate::block::{UfsFileStatus, UnderFileSystem};

/// The prefetch queue target.
pub const PREFETCH_SIZE: usize = 1000;

/// A lazy, finite iterator over the files of a UFS directory tree.
///
/// `has_next`/`next` advance monotonically and may suspend on UFS I/O when
/// the prefetch queue drains below a fifth of its target.
#[derive(Debug)]
pub struct FileListFetcher {
    /// The UFS being listed.
    ufs: Arc<UnderFileSystem>,
    /// The root of the listing.
    path: String,
    /// Prefetched file statuses.
    files: VecDeque<UfsFileStatus>,
    /// Set when the listing is exhausted.
    done: bool,
}

impl FileListFetcher {
    /// Creates a new `FileListFetcher` over the tree rooted at `path`.
    #[must_use]
    pub fn new(ufs: Arc<UnderFileSystem>, path: impl Into<String>) -> Self {
        Self {
            ufs,
            path: path.into(),
            files: VecDeque::new(),
            done: false,
        }
    }

    /// Refill the prefetch queue from the UFS. Returns how many statuses
    /// were fetched.
    async fn advance(&mut self) -> BlockStoreResult<usize> {
        if self.done {
            return Ok(0);
        }
        let statuses = self.ufs.list_status(&self.path).await?;
        let fetched = statuses.len();
        self.files.extend(statuses);
        self.done = true;
        Ok(fetched)
    }

    /// Whether another file is available.
    ///
    /// # Errors
    /// Returns the underlying listing error.
    pub async fn has_next(&mut self) -> BlockStoreResult<bool> {
        while !self.done && self.files.len() < PREFETCH_SIZE / 5 {
            if self.advance().await? == 0 {
                break;
            }
        }
        Ok(!self.files.is_empty())
    }

    /// The next file, or `None` when the listing is exhausted.
    ///
    /// # Errors
    /// Returns the underlying listing error.
    pub async fn next(&mut self) -> BlockStoreResult<Option<UfsFileStatus>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        Ok(self.files.pop_front())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iterates_all_files() {
        let ufs = UnderFileSystem::memory().unwrap();
        for i in 0..5 {
            ufs.operator()
                .write(&format!("/tree/f{i}"), vec![0_u8; 10 * (i + 1)])
                .await
                .unwrap();
        }
        let mut fetcher = FileListFetcher::new(Arc::new(ufs), "/tree/");

        let mut seen = Vec::new();
        while let Some(status) = fetcher.next().await.unwrap() {
            seen.push(status.path);
        }
        assert_eq!(seen.len(), 5);

        // The iterator stays exhausted.
        assert!(!fetcher.has_next().await.unwrap());
        assert!(fetcher.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let ufs = UnderFileSystem::memory().unwrap();
        let mut fetcher = FileListFetcher::new(Arc::new(ufs), "/nothing/");
        assert!(!fetcher.has_next().await.unwrap());
    }
}
