//! Block store event listeners.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::id::BlockId;

/// Where a block lives: a tier label plus a directory index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStoreLocation {
    /// The tier label.
    pub tier: String,
    /// The directory index within the tier.
    pub dir_index: u32,
}

impl BlockStoreLocation {
    /// Creates a new `BlockStoreLocation`.
    #[must_use]
    pub fn new(tier: impl Into<String>, dir_index: u32) -> Self {
        Self {
            tier: tier.into(),
            dir_index,
        }
    }
}

/// A listener of coarse block store events.
///
/// Listeners are invoked synchronously and must not block on the metadata
/// or block locks. Deliveries to one listener are serialized, so every
/// listener observes a total order of the events it receives.
#[allow(unused_variables)]
pub trait BlockStoreEventListener: Send + Sync {
    /// A block was committed to the local store.
    fn on_commit_block_to_local(&self, block_id: BlockId, location: &BlockStoreLocation) {}

    /// A block commit was reported to the master.
    fn on_commit_block_to_master(&self, block_id: BlockId, location: &BlockStoreLocation) {}

    /// A temp block was aborted.
    fn on_abort_block(&self, block_id: BlockId) {}

    /// A block was accessed.
    fn on_access_block(&self, block_id: BlockId) {}

    /// A block was moved on behalf of a client.
    fn on_move_block_by_client(
        &self,
        block_id: BlockId,
        src_location: &BlockStoreLocation,
        dst_location: &BlockStoreLocation,
    ) {
    }

    /// A block was removed on behalf of a client.
    fn on_remove_block_by_client(&self, block_id: BlockId) {}

    /// A block was removed by the worker itself.
    fn on_remove_block_by_worker(&self, block_id: BlockId) {}

    /// A block was removed from the given location.
    fn on_remove_block(&self, block_id: BlockId, location: &BlockStoreLocation) {}

    /// A block was lost.
    fn on_block_lost(&self, block_id: BlockId) {}

    /// A storage directory was lost.
    fn on_storage_lost(&self, tier: &str, path: &str) {}
}

/// One registered listener with its delivery mutex.
struct ListenerEntry {
    /// The listener itself.
    listener: Arc<dyn BlockStoreEventListener>,
    /// Serializes deliveries to this listener.
    serial: Arc<Mutex<()>>,
}

impl Clone for ListenerEntry {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            serial: Arc::clone(&self.serial),
        }
    }
}

/// An append-only registry of listeners.
///
/// Iteration works on a snapshot, so registration is safe under contention
/// and notification never holds the registry lock while calling out.
#[derive(Default)]
pub struct ListenerRegistry {
    /// The registered listeners.
    entries: RwLock<Vec<ListenerEntry>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    /// Creates a new empty `ListenerRegistry`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn register(&self, listener: Arc<dyn BlockStoreEventListener>) {
        self.entries.write().push(ListenerEntry {
            listener,
            serial: Arc::new(Mutex::new(())),
        });
    }

    /// Deliver one event to every listener, serialized per listener.
    pub fn notify_each(&self, notify: impl Fn(&dyn BlockStoreEventListener)) {
        let snapshot: Vec<ListenerEntry> = self.entries.read().clone();
        for entry in snapshot {
            let _serial = entry.serial.lock();
            notify(entry.listener.as_ref());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Records the order of events it observes.
    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl BlockStoreEventListener for RecordingListener {
        fn on_commit_block_to_local(&self, block_id: BlockId, _location: &BlockStoreLocation) {
            self.events.lock().push(format!("local:{block_id}"));
        }

        fn on_commit_block_to_master(&self, block_id: BlockId, _location: &BlockStoreLocation) {
            self.events.lock().push(format!("master:{block_id}"));
        }

        fn on_access_block(&self, block_id: BlockId) {
            self.events.lock().push(format!("access:{block_id}"));
        }
    }

    #[test]
    fn test_notify_order_per_listener() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(RecordingListener::default());
        registry.register(Arc::clone(&listener) as Arc<dyn BlockStoreEventListener>);

        let location = BlockStoreLocation::new("MEM", 0);
        registry.notify_each(|l| l.on_commit_block_to_local(1, &location));
        registry.notify_each(|l| l.on_commit_block_to_master(1, &location));
        registry.notify_each(|l| l.on_access_block(1));

        let events = listener.events.lock().clone();
        assert_eq!(events, vec!["local:1", "master:1", "access:1"]);
    }

    #[test]
    fn test_all_registered_listeners_observe() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(RecordingListener::default());
        let second = Arc::new(RecordingListener::default());
        registry.register(Arc::clone(&first) as Arc<dyn BlockStoreEventListener>);
        registry.register(Arc::clone(&second) as Arc<dyn BlockStoreEventListener>);

        registry.notify_each(|l| l.on_access_block(9));

        assert_eq!(first.events.lock().len(), 1);
        assert_eq!(second.events.lock().len(), 1);
    }
}
