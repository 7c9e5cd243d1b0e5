//! Metrics for the paged block store.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_with_registry, IntCounter, Registry};

use super::PAGEDBLOCK_REGISTRY;

/// The block store related metrics.
pub static BLOCK_METRICS: Lazy<BlockMetrics> = Lazy::new(|| BlockMetrics::new(&PAGEDBLOCK_REGISTRY));

/// The block store related metrics.
#[derive(Debug)]
pub struct BlockMetrics {
    /// The total of blocks committed locally.
    block_commit_count: IntCounter,
    /// The total of page reads served from the local page store.
    page_hit_count: IntCounter,
    /// The total of page reads that fell back to the UFS.
    page_miss_count: IntCounter,
}

impl BlockMetrics {
    /// Creates an instance of `BlockMetrics` and registers its counters into
    /// the specified registry.
    ///
    /// # Panics
    /// This method panics if it called multiple times on the same registry.
    #[allow(clippy::expect_used)]
    fn new(registry: &Registry) -> Self {
        let block_commit_count = register_int_counter_with_registry!(
            "block_commit_count",
            "The total of blocks committed locally",
            registry,
        )
        .expect("Metrics name must be unique.");

        let page_hit_count = register_int_counter_with_registry!(
            "page_hit_count",
            "The total of page reads served from the local page store",
            registry,
        )
        .expect("Metrics name must be unique.");

        let page_miss_count = register_int_counter_with_registry!(
            "page_miss_count",
            "The total of page reads that fell back to the UFS",
            registry,
        )
        .expect("Metrics name must be unique.");

        Self {
            block_commit_count,
            page_hit_count,
            page_miss_count,
        }
    }

    /// Increase the committed block count.
    pub fn block_commit_count_inc(&self) {
        self.block_commit_count.inc();
    }

    /// Increase the page hit count.
    pub fn page_hit_count_inc(&self) {
        self.page_hit_count.inc();
    }

    /// Increase the page miss count.
    pub fn page_miss_count_inc(&self) {
        self.page_miss_count.inc();
    }
}
