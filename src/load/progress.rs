//! Progress reporting of the load job.

use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;

use super::job::{JobState, LoadJob};
use crate::block::error::{BlockStoreError, BlockStoreResult};

/// The format of a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgressReportFormat {
    /// A human readable report.
    Text,
    /// A structured JSON report.
    Json,
}

/// A point-in-time progress report of one load job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgressReport {
    /// Whether the report carries the per-file failure reasons.
    verbose: bool,
    /// The job state.
    job_state: JobState,
    /// The bandwidth granted to the job, if limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth: Option<u64>,
    /// Whether the job verifies the loaded files afterwards.
    verification_enabled: bool,
    /// Files loaded successfully.
    processed_file_count: u64,
    /// Bytes loaded successfully.
    loaded_byte_count: u64,
    /// Bytes of all enumerated files, known only for a full listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    total_byte_count: Option<u64>,
    /// Loaded bytes per elapsed second, absent right after the start.
    #[serde(skip_serializing_if = "Option::is_none")]
    throughput: Option<u64>,
    /// Failures over the files being processed, as a percentage.
    failure_percentage: f64,
    /// Why the job failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    /// How many files failed permanently.
    failed_file_count: usize,
    /// The failed files with reasons, only in verbose reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_files_with_reasons: Option<HashMap<String, String>>,
}

impl LoadProgressReport {
    /// Snapshot the progress of `job`.
    #[must_use]
    pub fn new(job: &LoadJob, verbose: bool) -> Self {
        let total_byte_count = (!job.use_partial_listing()).then(|| job.total_byte_count());
        let duration = job.duration_secs();
        let throughput = (duration > 0).then(|| job.loaded_byte_count() / duration);
        let processed_file_count = job.processed_file_count();
        #[allow(clippy::cast_precision_loss)]
        let failure_percentage = if processed_file_count == 0 {
            0.0
        } else {
            job.total_failure_count() as f64 / processed_file_count as f64 * 100.0
        };
        let failed_files = job.failed_files();
        let failed_file_count = failed_files.len();
        let failed_files_with_reasons =
            (verbose && failed_file_count > 0).then_some(failed_files);
        Self {
            verbose,
            job_state: job.state(),
            bandwidth: job.bandwidth(),
            verification_enabled: job.verification_enabled(),
            processed_file_count,
            loaded_byte_count: job.loaded_byte_count(),
            total_byte_count,
            throughput,
            failure_percentage,
            failure_reason: job.failed_reason(),
            failed_file_count,
            failed_files_with_reasons,
        }
    }

    /// Render the report in the requested format.
    ///
    /// # Errors
    /// Returns `Internal` when the JSON serialization fails.
    pub fn report(&self, format: JobProgressReportFormat) -> BlockStoreResult<String> {
        match format {
            JobProgressReportFormat::Text => Ok(self.text_report()),
            JobProgressReportFormat::Json => serde_json::to_string(self)
                .map_err(|e| BlockStoreError::Internal(anyhow!("failed to render report: {e}"))),
        }
    }

    /// The human readable report.
    fn text_report(&self) -> String {
        let mut progress = String::new();
        progress.push_str(&format!(
            "\tSettings:\tbandwidth: {}\tverify: {}\n",
            self.bandwidth
                .map_or_else(|| "unlimited".to_owned(), |b| b.to_string()),
            self.verification_enabled
        ));
        progress.push_str(&format!(
            "\tJob State: {:?}{}\n",
            self.job_state,
            self.failure_reason
                .as_ref()
                .map_or_else(String::new, |reason| format!(" ({reason})"))
        ));
        progress.push_str(&format!(
            "\tFiles Processed: {}\n",
            self.processed_file_count
        ));
        progress.push_str(&format!(
            "\tBytes Loaded: {}{}\n",
            format_bytes(self.loaded_byte_count),
            self.total_byte_count
                .map_or_else(String::new, |total| format!(" out of {}", format_bytes(total)))
        ));
        if let Some(throughput) = self.throughput {
            progress.push_str(&format!("\tThroughput: {}/s\n", format_bytes(throughput)));
        }
        progress.push_str(&format!(
            "\tFile load failure rate: {:.2}%\n",
            self.failure_percentage
        ));
        progress.push_str(&format!("\tFiles Failed: {}\n", self.failed_file_count));
        if self.verbose {
            if let Some(ref failed) = self.failed_files_with_reasons {
                let mut entries: Vec<_> = failed.iter().collect();
                entries.sort();
                for (file, reason) in entries {
                    progress.push_str(&format!("\t\t{file}: {reason}\n"));
                }
            }
        }
        progress
    }
}

/// Render a byte count with a binary unit suffix.
#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let suffix = UNITS
        .get(unit)
        .unwrap_or_else(|| unreachable!("The unit index is bounded."));
    if unit == 0 {
        format!("{bytes}{suffix}")
    } else {
        format!("{value:.2}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MB");
    }
}
