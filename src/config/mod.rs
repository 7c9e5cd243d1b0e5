//! Configurations of the paged block store and the load job.

mod config;

pub use config::{BlockStoreConfig, Config, LoadJobConfig};
