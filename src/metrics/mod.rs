//! `PagedBlock` metrics.

mod block;
mod load;

use once_cell::sync::Lazy;
use prometheus::Registry;

pub use self::block::BLOCK_METRICS;
pub use self::load::LOAD_METRICS;

/// The global metrics registry used by `PagedBlock`.
pub static PAGEDBLOCK_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
