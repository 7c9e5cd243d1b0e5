use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::block::error::{BlockStoreError, BlockStoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(author, version, about, long_about = None)]
#[serde(default)]
/// A config
pub struct Config {
    #[clap(long = "worker-id", value_name = "VALUE", default_value_t = 0)]
    /// The id of this worker as registered with the block master
    pub worker_id: u64,
    #[clap(long = "log-level", value_name = "VALUE", default_value = "debug")]
    /// Log level
    pub log_level: String,
    #[clap(long = "log-file", value_name = "VALUE", default_value = "./pagedblock.log")]
    /// Log file path
    pub log_file: String,
    #[clap(long = "ufs-root", value_name = "VALUE", default_value = "/tmp/pagedblock_ufs")]
    /// The root of the underlying file system
    pub ufs_root: String,
    #[clap(flatten)]
    /// Block store related config
    pub block_store: BlockStoreConfig,
    #[clap(flatten)]
    /// Load job related config
    pub load_job: LoadJobConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(std::iter::empty::<String>())
    }
}

/// Block store config
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct BlockStoreConfig {
    /// The size of pages, default is 1 MiB.
    #[clap(long = "page-size", value_name = "VALUE", default_value_t = 0x10_0000)]
    pub page_size: u64,
    /// The cache directories, separated by commas.
    #[clap(
        long = "cache-dirs",
        value_name = "VALUE",
        value_delimiter = ',',
        default_value = "/tmp/pagedblock_cache"
    )]
    pub cache_dirs: Vec<String>,
    /// The capacity of every cache directory in bytes, default is 512 MiB.
    #[clap(
        long = "cache-dir-capacity",
        value_name = "VALUE",
        default_value_t = 0x2000_0000
    )]
    pub cache_dir_capacity: u64,
    /// Bound on the exclusive lock wait when removing a block (in ms).
    #[clap(
        long = "remove-block-timeout-ms",
        value_name = "VALUE",
        default_value_t = 60_000
    )]
    pub remove_block_timeout_ms: u64,
    /// The storage tier label reported to the master.
    #[clap(long = "default-tier", value_name = "VALUE", default_value = "MEM")]
    pub default_tier: String,
    /// The storage medium label reported to the master.
    #[clap(long = "default-medium", value_name = "VALUE", default_value = "MEM")]
    pub default_medium: String,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Config::default().block_store
    }
}

/// Load job config
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct LoadJobConfig {
    /// Max files pulled into one prepared batch.
    #[clap(long = "job-batch-size", value_name = "VALUE", default_value_t = 100)]
    pub batch_size: usize,
}

impl Default for LoadJobConfig {
    fn default() -> Self {
        Config::default().load_job
    }
}

impl Config {
    /// Validate the config values.
    ///
    /// # Errors
    /// Returns `InvalidState` when an option is out of its legal range.
    pub fn validate(&self) -> BlockStoreResult<()> {
        if self.block_store.page_size == 0 {
            return Err(BlockStoreError::InvalidState(
                "page_size must be greater than 0".to_owned(),
            ));
        }
        if self.block_store.cache_dirs.is_empty() {
            return Err(BlockStoreError::InvalidState(
                "at least one cache dir is required".to_owned(),
            ));
        }
        if self.load_job.batch_size == 0 {
            return Err(BlockStoreError::InvalidState(
                "batch_size must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.block_store.page_size, 0x10_0000);
        assert_eq!(config.block_store.remove_block_timeout_ms, 60_000);
        assert_eq!(config.block_store.default_tier, "MEM");
        assert_eq!(config.block_store.default_medium, "MEM");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_page_size() {
        let mut config = Config::default();
        config.block_store.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_cache_dirs() {
        let config = Config::parse_from(["pagedblock", "--cache-dirs", "/a,/b"]);
        assert_eq!(config.block_store.cache_dirs, vec!["/a", "/b"]);
    }
}
