//! The persisted journal entry of a load job.

use serde::{Deserialize, Serialize};

use super::job::JobState;

/// Everything needed to recover a load job from the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadJobJournalEntry {
    /// The job id.
    pub job_id: String,
    /// The root path being loaded.
    pub load_path: String,
    /// The job state.
    pub state: JobState,
    /// Whether the listing is partial.
    pub partial_listing: bool,
    /// Whether the job verifies the loaded files afterwards.
    pub verify: bool,
    /// The submitting user, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// The bandwidth granted to the job, if limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    /// When the job reached a terminal state, in epoch ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
}
