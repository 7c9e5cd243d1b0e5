//! Metrics for the load job.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_with_registry, IntCounter, Registry};

use super::PAGEDBLOCK_REGISTRY;

/// The load job related metrics.
pub static LOAD_METRICS: Lazy<LoadMetrics> = Lazy::new(|| LoadMetrics::new(&PAGEDBLOCK_REGISTRY));

/// The load job related metrics.
#[derive(Debug)]
pub struct LoadMetrics {
    /// The total of load jobs that succeeded.
    job_load_success: IntCounter,
    /// The total of load jobs that failed.
    job_load_fail: IntCounter,
    /// The total of files loaded by all jobs.
    job_load_file_count: IntCounter,
    /// The total of per-file load failures, including retried ones.
    job_load_file_fail: IntCounter,
    /// The total of bytes loaded by all jobs.
    job_load_file_size: IntCounter,
}

impl LoadMetrics {
    /// Creates an instance of `LoadMetrics` and registers its counters into
    /// the specified registry.
    ///
    /// # Panics
    /// This method panics if it called multiple times on the same registry.
    #[allow(clippy::expect_used)]
    fn new(registry: &Registry) -> Self {
        let job_load_success = register_int_counter_with_registry!(
            "job_load_success",
            "The total of load jobs that succeeded",
            registry,
        )
        .expect("Metrics name must be unique.");

        let job_load_fail = register_int_counter_with_registry!(
            "job_load_fail",
            "The total of load jobs that failed",
            registry,
        )
        .expect("Metrics name must be unique.");

        let job_load_file_count = register_int_counter_with_registry!(
            "job_load_file_count",
            "The total of files loaded by all jobs",
            registry,
        )
        .expect("Metrics name must be unique.");

        let job_load_file_fail = register_int_counter_with_registry!(
            "job_load_file_fail",
            "The total of per-file load failures",
            registry,
        )
        .expect("Metrics name must be unique.");

        let job_load_file_size = register_int_counter_with_registry!(
            "job_load_file_size",
            "The total of bytes loaded by all jobs",
            registry,
        )
        .expect("Metrics name must be unique.");

        Self {
            job_load_success,
            job_load_fail,
            job_load_file_count,
            job_load_file_fail,
            job_load_file_size,
        }
    }

    /// Increase the succeeded job count.
    pub fn job_load_success_inc(&self) {
        self.job_load_success.inc();
    }

    /// Increase the failed job count.
    pub fn job_load_fail_inc(&self) {
        self.job_load_fail.inc();
    }

    /// Increase the loaded file count by `count`.
    pub fn job_load_file_count_inc_by(&self, count: u64) {
        self.job_load_file_count.inc_by(count);
    }

    /// Increase the per-file failure count.
    pub fn job_load_file_fail_inc(&self) {
        self.job_load_file_fail.inc();
    }

    /// Increase the loaded byte count by `bytes`.
    pub fn job_load_file_size_inc_by(&self, bytes: u64) {
        self.job_load_file_size.inc_by(bytes);
    }
}
