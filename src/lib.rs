//! `PagedBlock`
//!
//! A worker-side block store that keeps block contents as fixed-size pages
//! spread over one or more cache directories, streaming from an underlying
//! file system (UFS) on cache miss, plus a scheduler-driven load job that
//! prefetches whole directory trees onto workers.

#![deny(
    anonymous_parameters,
    bare_trait_objects,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces
)]
#![allow(
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::module_inception // We consider mod.rs as a declaration file.
)]

/// The paged block store
pub mod block;
/// Utilities shared across the crate
pub mod common;
/// Configurations
pub mod config;
/// The load job driven by the scheduler
pub mod load;
/// Metrics of the crate
pub mod metrics;
