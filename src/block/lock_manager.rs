//! Per-block shared/exclusive locks scoped to sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use super::error::{BlockStoreError, BlockStoreResult};
use super::id::{BlockId, SessionId};

/// The mode of a block lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLockMode {
    /// Multiple holders are allowed at the same instant.
    Shared,
    /// A single holder excludes all the others.
    Exclusive,
}

/// The guard actually held for one acquisition.
enum HeldGuard {
    /// A shared guard.
    Shared(OwnedRwLockReadGuard<()>),
    /// An exclusive guard.
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl std::fmt::Debug for HeldGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Shared(_) => f.write_str("Shared"),
            Self::Exclusive(_) => f.write_str("Exclusive"),
        }
    }
}

/// One live acquisition, indexed by lock id.
#[derive(Debug)]
struct HeldLock {
    /// The owning session.
    session_id: SessionId,
    /// The locked block.
    block_id: BlockId,
    /// The guard, dropped on release.
    guard: HeldGuard,
}

/// The lock of one block, shared by all its acquisitions.
struct LockEntry {
    /// The reader-writer lock. Waiters queue fairly, so new shared
    /// acquisitions cannot starve a waiting exclusive one.
    lock: Arc<RwLock<()>>,
    /// Acquisitions in flight or held, for entry cleanup.
    refs: usize,
}

/// The shared state of the lock manager.
#[derive(Default)]
struct LockManagerInner {
    /// Per-block lock entries.
    entries: Mutex<HashMap<BlockId, LockEntry>>,
    /// Live acquisitions by lock id.
    held: Mutex<HashMap<u64, HeldLock>>,
    /// The lock id generator.
    next_lock_id: AtomicU64,
}

impl Default for LockEntry {
    fn default() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        }
    }
}

impl LockManagerInner {
    /// Pick the lock of `block_id`, creating the entry on first use.
    fn entry_lock(&self, block_id: BlockId) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(block_id).or_default();
        entry.refs = entry.refs.saturating_add(1);
        Arc::clone(&entry.lock)
    }

    /// Drop one reference of the entry of `block_id`, removing the entry
    /// when no acquisition uses it anymore.
    fn unref_entry(&self, block_id: BlockId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&block_id) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(&block_id);
            }
        }
    }

    /// Release the acquisition of `lock_id`, dropping its guard.
    fn release(&self, lock_id: u64) {
        let held = self.held.lock().remove(&lock_id);
        match held {
            Some(held) => {
                drop(held.guard);
                self.unref_entry(held.block_id);
                debug!("released lock {lock_id} of block {}", held.block_id);
            }
            None => {
                // Double release is a caller bug, surface it loudly.
                warn!("lock {lock_id} was already released");
            }
        }
    }
}

/// A handle for one lock acquisition. Dropping the handle releases exactly
/// one acquisition.
#[derive(Debug)]
pub struct BlockLock {
    /// The lock id of this acquisition.
    lock_id: u64,
    /// The owning session.
    session_id: SessionId,
    /// The locked block.
    block_id: BlockId,
    /// The mode this lock was acquired with.
    mode: BlockLockMode,
    /// Back reference for release on drop.
    manager: Weak<LockManagerInner>,
}

impl BlockLock {
    /// The lock id of this acquisition.
    #[must_use]
    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    /// The locked block.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The owning session.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The mode this lock was acquired with.
    #[must_use]
    pub fn mode(&self) -> BlockLockMode {
        self.mode
    }
}

impl Drop for BlockLock {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(self.lock_id);
        }
    }
}

/// The per-block lock manager.
///
/// Lock entries out-live the block metadata: a session may hold a lock on a
/// block id that has no metadata yet, or not anymore.
#[derive(Default)]
pub struct BlockLockManager {
    /// The shared state, weakly referenced by handles.
    inner: Arc<LockManagerInner>,
}

impl std::fmt::Debug for BlockLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLockManager")
            .field("held", &self.inner.held.lock().len())
            .finish_non_exhaustive()
    }
}

impl BlockLockManager {
    /// Creates a new `BlockLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock of `block_id` in the requested mode, waiting until it
    /// is granted.
    pub async fn acquire(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        mode: BlockLockMode,
    ) -> BlockLock {
        let lock = self.inner.entry_lock(block_id);
        let guard = match mode {
            BlockLockMode::Shared => HeldGuard::Shared(lock.read_owned().await),
            BlockLockMode::Exclusive => HeldGuard::Exclusive(lock.write_owned().await),
        };
        self.register(session_id, block_id, mode, guard)
    }

    /// Acquire a lock of `block_id` in the requested mode, waiting at most
    /// `timeout`.
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` when the lock is not granted in time.
    pub async fn try_acquire(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        mode: BlockLockMode,
        timeout: Duration,
    ) -> BlockStoreResult<BlockLock> {
        let lock = self.inner.entry_lock(block_id);
        let acquired = tokio::time::timeout(timeout, async {
            match mode {
                BlockLockMode::Shared => HeldGuard::Shared(lock.read_owned().await),
                BlockLockMode::Exclusive => HeldGuard::Exclusive(lock.write_owned().await),
            }
        })
        .await;
        match acquired {
            Ok(guard) => Ok(self.register(session_id, block_id, mode, guard)),
            Err(_) => {
                self.inner.unref_entry(block_id);
                Err(BlockStoreError::DeadlineExceeded(format!(
                    "can not acquire lock of block {block_id} for session {session_id} after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Verify that `lock_id` is a live acquisition of `block_id` owned by
    /// `session_id`.
    ///
    /// # Errors
    /// Returns `InvalidState` when the claim does not hold.
    pub fn validate(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        lock_id: u64,
    ) -> BlockStoreResult<()> {
        let held = self.inner.held.lock();
        match held.get(&lock_id) {
            Some(lock) if lock.session_id == session_id && lock.block_id == block_id => Ok(()),
            Some(lock) => Err(BlockStoreError::InvalidState(format!(
                "lock {lock_id} belongs to session {} and block {}, not session {session_id} and block {block_id}",
                lock.session_id, lock.block_id
            ))),
            None => Err(BlockStoreError::InvalidState(format!(
                "lock {lock_id} is not held"
            ))),
        }
    }

    /// Release every lock held by `session_id`.
    pub fn release_session(&self, session_id: SessionId) {
        let lock_ids: Vec<u64> = self
            .inner
            .held
            .lock()
            .iter()
            .filter(|(_, lock)| lock.session_id == session_id)
            .map(|(&lock_id, _)| lock_id)
            .collect();
        for lock_id in lock_ids {
            self.inner.release(lock_id);
        }
    }

    /// The number of live acquisitions.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Record a granted acquisition and hand out its handle.
    fn register(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        mode: BlockLockMode,
        guard: HeldGuard,
    ) -> BlockLock {
        let lock_id = self.inner.next_lock_id.fetch_add(1, Ordering::Relaxed);
        self.inner.held.lock().insert(
            lock_id,
            HeldLock {
                session_id,
                block_id,
                guard,
            },
        );
        BlockLock {
            lock_id,
            session_id,
            block_id,
            mode,
            manager: Arc::downgrade(&self.inner),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let manager = BlockLockManager::new();
        let lock_a = manager.acquire(1, 42, BlockLockMode::Shared).await;
        let lock_b = manager.acquire(2, 42, BlockLockMode::Shared).await;
        assert_eq!(manager.held_count(), 2);
        drop(lock_a);
        drop(lock_b);
        assert_eq!(manager.held_count(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_excludes_shared() {
        let manager = BlockLockManager::new();
        let writer = manager.acquire(1, 42, BlockLockMode::Exclusive).await;
        let err = manager
            .try_acquire(2, 42, BlockLockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockStoreError::DeadlineExceeded(_)));

        drop(writer);
        let _reader = manager
            .try_acquire(2, 42, BlockLockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared() {
        let manager = BlockLockManager::new();
        let reader = manager.acquire(1, 7, BlockLockMode::Shared).await;
        let err = manager
            .try_acquire(2, 7, BlockLockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockStoreError::DeadlineExceeded(_)));
        drop(reader);
        let _writer = manager
            .try_acquire(2, 7, BlockLockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_locks_on_distinct_blocks_are_independent() {
        let manager = BlockLockManager::new();
        let _writer_a = manager.acquire(1, 1, BlockLockMode::Exclusive).await;
        let _writer_b = manager
            .try_acquire(1, 2, BlockLockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate() {
        let manager = BlockLockManager::new();
        let lock = manager.acquire(1, 42, BlockLockMode::Shared).await;
        manager.validate(1, 42, lock.lock_id()).unwrap();
        assert!(manager.validate(2, 42, lock.lock_id()).is_err());
        assert!(manager.validate(1, 43, lock.lock_id()).is_err());
        assert!(manager.validate(1, 42, lock.lock_id() + 1).is_err());
    }

    #[tokio::test]
    async fn test_release_session() {
        let manager = BlockLockManager::new();
        let lock_a = manager.acquire(1, 1, BlockLockMode::Shared).await;
        let _lock_b = manager.acquire(1, 2, BlockLockMode::Shared).await;
        let _other = manager.acquire(2, 3, BlockLockMode::Shared).await;

        manager.release_session(1);
        assert_eq!(manager.held_count(), 1);

        // The exclusive mode is grantable again after the cleanup.
        let _writer = manager
            .try_acquire(3, 1, BlockLockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();

        // Dropping a handle whose lock was force-released must not panic.
        drop(lock_a);
    }
}
