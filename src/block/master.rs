//! The block master client seam.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::error::BlockStoreResult;
use super::id::BlockId;

/// An RPC client for reporting block commits and usage to the block master.
///
/// `commit_block` is idempotent on the master side, so the worker may retry.
#[async_trait]
pub trait BlockMasterClient: Send + Sync {
    /// Report a committed block together with the worker's used bytes.
    async fn commit_block(
        &self,
        worker_id: u64,
        used_bytes: u64,
        tier: &str,
        medium: &str,
        block_id: BlockId,
        length: u64,
    ) -> BlockStoreResult<()>;
}

/// A pool of block master clients handed out round-robin.
pub struct BlockMasterClientPool {
    /// The pooled clients.
    clients: Mutex<VecDeque<Arc<dyn BlockMasterClient>>>,
}

impl std::fmt::Debug for BlockMasterClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMasterClientPool")
            .field("clients", &self.clients.lock().len())
            .finish_non_exhaustive()
    }
}

impl BlockMasterClientPool {
    /// Creates a pool over the given clients.
    ///
    /// # Panics
    /// Panics when `clients` is empty.
    #[must_use]
    pub fn new(clients: Vec<Arc<dyn BlockMasterClient>>) -> Self {
        assert!(!clients.is_empty(), "the master client pool cannot be empty");
        Self {
            clients: Mutex::new(clients.into_iter().collect()),
        }
    }

    /// Pick a client from the pool.
    #[must_use]
    pub fn acquire(&self) -> Arc<dyn BlockMasterClient> {
        let mut clients = self.clients.lock();
        let client = clients
            .pop_front()
            .unwrap_or_else(|| unreachable!("The pool is ensured to be non-empty."));
        clients.push_back(Arc::clone(&client));
        client
    }
}

/// A stand-in master client used when no master is configured, for example
/// in a stand-alone worker. Commits are only logged.
#[derive(Debug, Default)]
pub struct LoggingBlockMasterClient;

#[async_trait]
impl BlockMasterClient for LoggingBlockMasterClient {
    async fn commit_block(
        &self,
        worker_id: u64,
        used_bytes: u64,
        tier: &str,
        medium: &str,
        block_id: BlockId,
        length: u64,
    ) -> BlockStoreResult<()> {
        info!(
            "commit block {block_id} of {length} bytes on worker {worker_id} \
             (tier {tier}, medium {medium}, used bytes {used_bytes})"
        );
        Ok(())
    }
}
