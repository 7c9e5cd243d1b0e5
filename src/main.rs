//! The `PagedBlock` worker daemon.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use pagedblock::block::{
    BlockMasterClient, BlockMasterClientPool, LoggingBlockMasterClient, PagedBlockStore,
    UnderFileSystem,
};
use pagedblock::common::logger::init_logger;
use pagedblock::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logger(&config.log_file, &config.log_level)?;
    config.validate()?;

    let ufs = UnderFileSystem::file_system(&config.ufs_root)?;
    let clients: Vec<Arc<dyn BlockMasterClient>> = vec![Arc::new(LoggingBlockMasterClient)];
    let master_client_pool = Arc::new(BlockMasterClientPool::new(clients));
    let worker_id = Arc::new(AtomicU64::new(config.worker_id));
    let store = PagedBlockStore::create(&config, ufs, master_client_pool, worker_id)?;

    let meta = store.store_meta().await;
    info!(
        "paged block store is up: {} dirs, {} bytes capacity, {} bytes used",
        meta.dirs.len(),
        meta.capacity_bytes,
        meta.used_bytes
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
