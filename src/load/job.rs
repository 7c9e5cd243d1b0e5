//! The load job state machine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clippy_utilities::NumericCast;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::iterator::FileListFetcher;
use super::journal::LoadJobJournalEntry;
use super::policy::HashBasedWorkerAssignPolicy;
use super::progress::{JobProgressReportFormat, LoadProgressReport};
use super::worker_client::{
    BlockWorkerClient, LoadFile, LoadFileRequest, LoadFileResponse, TaskStatus, UfsReadOptions,
    WorkerInfo,
};
use crate::block::error::{BlockStoreError, BlockStoreResult};
use crate::block::{UfsFileStatus, UnderFileSystem};
use crate::config::LoadJobConfig;
use crate::metrics::LOAD_METRICS;

/// At most this many files are packed into one task.
pub const MAX_FILES_PER_TASK: usize = 20;
/// The retry deque holds at most this many files.
pub const RETRY_BLOCK_CAPACITY: usize = 1000;
/// At most this many retries are drained into one batch.
const RETRY_THRESHOLD: usize = RETRY_BLOCK_CAPACITY * 4 / 5;
/// The job stays healthy up to this many file failures.
const FAILURE_COUNT_THRESHOLD: u64 = 100;
/// Or up to this failure ratio over the files being processed.
const FAILURE_RATIO_THRESHOLD: f64 = 0.05;

/// The state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// The job is making progress.
    Running,
    /// The job is verifying the loaded files.
    Verifying,
    /// The job finished successfully.
    Succeeded,
    /// The job failed permanently.
    Failed,
    /// The job was stopped.
    Stopped,
}

/// One batch of files dispatched to one worker.
#[derive(Debug)]
pub struct LoadTask {
    /// The task id, unique within the job.
    task_id: u64,
    /// The worker the task runs on.
    worker: WorkerInfo,
    /// The files to load.
    files: Vec<UfsFileStatus>,
    /// The in-flight response, set once the task is submitted.
    response: Option<JoinHandle<BlockStoreResult<LoadFileResponse>>>,
}

impl LoadTask {
    /// Creates a new `LoadTask`.
    fn new(task_id: u64, worker: WorkerInfo, files: Vec<UfsFileStatus>) -> Self {
        Self {
            task_id,
            worker,
            files,
            response: None,
        }
    }

    /// The task id.
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The worker the task runs on.
    #[must_use]
    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    /// The files to load.
    #[must_use]
    pub fn files(&self) -> &[UfsFileStatus] {
        &self.files
    }

    /// Cancel the in-flight task. All its files will be retried when the
    /// response is processed.
    pub fn cancel(&self) {
        if let Some(handle) = &self.response {
            handle.abort();
        }
    }

    /// Build the load request of this task.
    fn build_request(&self, job_id: &str, bandwidth: Option<u64>) -> LoadFileRequest {
        LoadFileRequest {
            files: self
                .files
                .iter()
                .map(|status| LoadFile {
                    path: status.path.clone(),
                    length: status.length,
                    ufs_path: status.ufs_path.clone(),
                })
                .collect(),
            options: UfsReadOptions {
                tag: job_id.to_owned(),
                position_short: false,
                bandwidth,
            },
        }
    }
}

/// Milliseconds since the epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().numeric_cast())
        .unwrap_or(0)
}

/// A load job prefetching a directory tree onto the workers.
///
/// State transitions run on the scheduler thread; the statistics are kept
/// in atomics because task callbacks update them concurrently.
#[derive(Debug)]
pub struct LoadJob {
    /// The job id.
    job_id: String,
    /// The root path being loaded.
    path: String,
    /// The submitting user, if known.
    user: Option<String>,
    /// The bandwidth granted to the job, if limited.
    bandwidth: Option<u64>,
    /// Whether the listing is partial.
    use_partial_listing: bool,
    /// Whether the job verifies the loaded files afterwards.
    verification_enabled: bool,
    /// Max files pulled into one prepared batch.
    batch_size: usize,
    /// When the job was created, in epoch ms.
    start_time_ms: u64,
    /// When the job reached a terminal state, in epoch ms.
    end_time_ms: Mutex<Option<u64>>,
    /// The job state.
    state: Mutex<JobState>,
    /// Why the job failed, if it did.
    failed_reason: Mutex<Option<String>>,
    /// Files waiting to be retried, bounded by `RETRY_BLOCK_CAPACITY`.
    retry_files: Mutex<VecDeque<String>>,
    /// Permanently failed files with their first-observed reason.
    failed_files: Mutex<HashMap<String, String>>,
    /// Files loaded successfully.
    processed_file_count: AtomicU64,
    /// Bytes loaded successfully.
    loaded_byte_count: AtomicU64,
    /// Bytes of all enumerated files.
    total_byte_count: AtomicU64,
    /// Files handed to tasks, including retries.
    processing_file_count: AtomicU64,
    /// File failures, including retried ones.
    total_failure_count: AtomicU64,
    /// Latched once the health gate trips.
    health_lost: AtomicBool,
    /// Single-entry guard of `prepare_next_tasks`.
    preparing_tasks: AtomicBool,
    /// Tasks currently in flight.
    running_tasks: Mutex<HashSet<u64>>,
    /// The task id generator.
    task_id_gen: AtomicU64,
    /// The lazy directory iterator.
    file_iterator: tokio::sync::Mutex<FileListFetcher>,
    /// The UFS, used to re-stat retried files.
    ufs: Arc<UnderFileSystem>,
    /// The worker assignment policy.
    policy: HashBasedWorkerAssignPolicy,
}

impl LoadJob {
    /// Creates a new `LoadJob` over the tree rooted at `path`.
    ///
    /// # Errors
    /// Returns `InvalidState` when `bandwidth` is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<String>,
        user: Option<String>,
        job_id: impl Into<String>,
        bandwidth: Option<u64>,
        use_partial_listing: bool,
        verification_enabled: bool,
        ufs: Arc<UnderFileSystem>,
        config: &LoadJobConfig,
    ) -> BlockStoreResult<Self> {
        if bandwidth == Some(0) {
            return Err(BlockStoreError::InvalidState(
                "bandwidth should be greater than 0 if provided".to_owned(),
            ));
        }
        let path = path.into();
        let file_iterator = FileListFetcher::new(Arc::clone(&ufs), path.clone());
        Ok(Self {
            job_id: job_id.into(),
            path,
            user,
            bandwidth,
            use_partial_listing,
            verification_enabled,
            batch_size: config.batch_size,
            start_time_ms: now_ms(),
            end_time_ms: Mutex::new(None),
            state: Mutex::new(JobState::Running),
            failed_reason: Mutex::new(None),
            retry_files: Mutex::new(VecDeque::new()),
            failed_files: Mutex::new(HashMap::new()),
            processed_file_count: AtomicU64::new(0),
            loaded_byte_count: AtomicU64::new(0),
            total_byte_count: AtomicU64::new(0),
            processing_file_count: AtomicU64::new(0),
            total_failure_count: AtomicU64::new(0),
            health_lost: AtomicBool::new(false),
            preparing_tasks: AtomicBool::new(false),
            running_tasks: Mutex::new(HashSet::new()),
            task_id_gen: AtomicU64::new(0),
            file_iterator: tokio::sync::Mutex::new(file_iterator),
            ufs,
            policy: HashBasedWorkerAssignPolicy,
        })
    }

    /// The job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The root path being loaded.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The bandwidth granted to the job.
    #[must_use]
    pub fn bandwidth(&self) -> Option<u64> {
        self.bandwidth
    }

    /// Whether the listing is partial.
    #[must_use]
    pub fn use_partial_listing(&self) -> bool {
        self.use_partial_listing
    }

    /// Whether the job verifies the loaded files afterwards.
    #[must_use]
    pub fn verification_enabled(&self) -> bool {
        self.verification_enabled
    }

    /// The job state.
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    /// Why the job failed, if it did.
    #[must_use]
    pub fn failed_reason(&self) -> Option<String> {
        self.failed_reason.lock().clone()
    }

    /// Files loaded successfully.
    #[must_use]
    pub fn processed_file_count(&self) -> u64 {
        self.processed_file_count.load(Ordering::Acquire)
    }

    /// Bytes loaded successfully.
    #[must_use]
    pub fn loaded_byte_count(&self) -> u64 {
        self.loaded_byte_count.load(Ordering::Acquire)
    }

    /// Bytes of all enumerated files.
    #[must_use]
    pub fn total_byte_count(&self) -> u64 {
        self.total_byte_count.load(Ordering::Acquire)
    }

    /// File failures, including retried ones.
    #[must_use]
    pub fn total_failure_count(&self) -> u64 {
        self.total_failure_count.load(Ordering::Acquire)
    }

    /// The permanently failed files with their first-observed reasons.
    #[must_use]
    pub fn failed_files(&self) -> HashMap<String, String> {
        self.failed_files.lock().clone()
    }

    /// How many files wait in the retry deque.
    #[must_use]
    pub fn retry_file_count(&self) -> usize {
        self.retry_files.lock().len()
    }

    /// The job duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> u64 {
        let end = self.end_time_ms.lock().unwrap_or_else(now_ms);
        end.saturating_sub(self.start_time_ms) / 1000
    }

    /// Prepare the next set of tasks. Only one caller prepares at a time;
    /// concurrent callers get the empty list.
    ///
    /// # Errors
    /// Currently infallible, kept fallible for scheduler parity.
    pub async fn get_next_tasks(
        &self,
        workers: &[WorkerInfo],
    ) -> BlockStoreResult<Vec<LoadTask>> {
        if self
            .preparing_tasks
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let tasks = self.prepare_next_tasks(workers).await;
            self.preparing_tasks.store(false, Ordering::Release);
            return tasks;
        }
        Ok(Vec::new())
    }

    /// Drain retries, pull from the iterator, and bucket the batch into
    /// per-worker tasks.
    async fn prepare_next_tasks(
        &self,
        workers: &[WorkerInfo],
    ) -> BlockStoreResult<Vec<LoadTask>> {
        debug!("preparing next set of tasks for job {}", self.job_id);
        let mut batch = Vec::new();

        // Re-stat queued retries first. A file gone from the UFS is
        // dropped, a file that cannot be stat-ed goes back to the deque.
        let start_retry_len = self.retry_files.lock().len();
        let mut attempts = 0;
        while batch.len() < RETRY_THRESHOLD && attempts < start_retry_len {
            let Some(path) = self.retry_files.lock().pop_front() else {
                break;
            };
            attempts += 1;
            match self.ufs.get_status(&path).await {
                Ok(status) => batch.push(status),
                Err(BlockStoreError::NotFound(_)) => {}
                Err(_) => self.retry_files.lock().push_back(path),
            }
        }

        {
            let mut iterator = self.file_iterator.lock().await;
            while batch.len() < self.batch_size {
                match iterator.next().await {
                    Ok(Some(status)) => batch.push(status),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error getting next file for job {}: {e}", self.job_id);
                        if !e.is_retryable() {
                            self.fail_job(&e);
                        }
                        break;
                    }
                }
            }
        }

        // The active workers may not reflect all workers at start up, but
        // the hash policy stays deterministic over the recognized ones.
        let mut worker_tasks: HashMap<u64, Vec<LoadTask>> = HashMap::new();
        for status in batch {
            let Some(worker) = self.policy.pick_worker(&status.path, workers) else {
                if !self.offer_retry(status.path.clone()) {
                    self.add_file_failure(&status.path, "no worker available", 14);
                }
                continue;
            };
            let tasks = worker_tasks.entry(worker.id).or_default();
            match tasks.last_mut() {
                Some(task) if task.files.len() < MAX_FILES_PER_TASK => {
                    task.files.push(status.clone());
                }
                _ => tasks.push(LoadTask::new(
                    self.task_id_gen.fetch_add(1, Ordering::Relaxed),
                    worker.clone(),
                    vec![status.clone()],
                )),
            }
            self.total_byte_count
                .fetch_add(status.length, Ordering::AcqRel);
            self.processing_file_count.fetch_add(1, Ordering::AcqRel);
        }
        let tasks: Vec<LoadTask> = worker_tasks.into_values().flatten().collect();
        debug!("prepared {} tasks for job {}", tasks.len(), self.job_id);
        Ok(tasks)
    }

    /// Submit a prepared task to its worker.
    pub fn submit_task(&self, task: &mut LoadTask, client: Arc<dyn BlockWorkerClient>) {
        self.running_tasks.lock().insert(task.task_id);
        let request = task.build_request(&self.job_id, self.bandwidth);
        debug!(
            "start running task {} with {} files on worker {}",
            task.task_id,
            request.files.len(),
            task.worker.address
        );
        task.response = Some(tokio::spawn(
            async move { client.load_file(request).await },
        ));
    }

    /// A task could not be submitted, retry all its files.
    pub fn on_task_submit_failure(&self, task: &LoadTask) {
        self.running_tasks.lock().remove(&task.task_id);
        for file in &task.files {
            self.add_files_to_retry(file.path.clone());
        }
    }

    /// Reconcile one finished task. Returns whether the task counts as
    /// retryable for the scheduler.
    pub async fn process_response(&self, task: &mut LoadTask) -> bool {
        let retryable = self.process_response_inner(task).await;
        self.running_tasks.lock().remove(&task.task_id);
        retryable
    }

    /// The classification of the task outcome.
    async fn process_response_inner(&self, task: &mut LoadTask) -> bool {
        let Some(handle) = task.response.take() else {
            warn!("task {} was never submitted", task.task_id);
            for file in &task.files {
                self.add_files_to_retry(file.path.clone());
            }
            return false;
        };
        let mut total_loaded_bytes: u64 = task.files.iter().map(|file| file.length).sum();
        match handle.await {
            Ok(Ok(response)) => {
                if response.status != TaskStatus::Success {
                    debug!(
                        "worker {} failed files {:?}",
                        task.worker.address, response.failures
                    );
                    for failure in &response.failures {
                        total_loaded_bytes =
                            total_loaded_bytes.saturating_sub(failure.file.length);
                        if !self.is_healthy()
                            || !failure.retryable
                            || !self.add_files_to_retry(failure.file.path.clone())
                        {
                            self.add_file_failure(
                                &failure.file.path,
                                &failure.message,
                                failure.code,
                            );
                        }
                    }
                }
                let loaded_files: u64 = task
                    .files
                    .len()
                    .saturating_sub(response.failures.len())
                    .numeric_cast();
                self.loaded_byte_count
                    .fetch_add(total_loaded_bytes, Ordering::AcqRel);
                self.processed_file_count
                    .fetch_add(loaded_files, Ordering::AcqRel);
                LOAD_METRICS.job_load_file_count_inc_by(loaded_files);
                LOAD_METRICS.job_load_file_size_inc_by(total_loaded_bytes);
                response.status != TaskStatus::Failure
            }
            Ok(Err(e)) => {
                warn!("exception when trying to get load response: {e}");
                for file in &task.files {
                    if !self.is_healthy() || !self.add_files_to_retry(file.path.clone()) {
                        self.add_file_failure(&file.path, &e.to_string(), e.status_code());
                    }
                }
                false
            }
            Err(join_error) if join_error.is_cancelled() => {
                // A cancelled task is not a failure, its files are retried.
                warn!("task {} got cancelled and will retry", task.task_id);
                for file in &task.files {
                    self.add_files_to_retry(file.path.clone());
                }
                true
            }
            Err(join_error) => {
                warn!("task {} aborted: {join_error}", task.task_id);
                for file in &task.files {
                    if !self.is_healthy() || !self.add_files_to_retry(file.path.clone()) {
                        self.add_file_failure(&file.path, &join_error.to_string(), 13);
                    }
                }
                false
            }
        }
    }

    /// Whether the job is healthy. Once the failure gate trips the answer
    /// stays `false`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if self.health_lost.load(Ordering::Acquire) {
            return false;
        }
        let total_failure = self.total_failure_count.load(Ordering::Acquire);
        let processing = self.processing_file_count.load(Ordering::Acquire);
        #[allow(clippy::cast_precision_loss)]
        let ratio = if processing == 0 {
            0.0
        } else {
            total_failure as f64 / processing as f64
        };
        let healthy = self.state() != JobState::Failed
            && (total_failure <= FAILURE_COUNT_THRESHOLD || ratio <= FAILURE_RATIO_THRESHOLD);
        if !healthy {
            self.health_lost.store(true, Ordering::Release);
        }
        healthy
    }

    /// Whether the current pass is done: the iterator is exhausted, the
    /// retry deque is empty, and no task is in flight.
    pub async fn is_current_pass_done(&self) -> bool {
        let has_next = {
            let mut iterator = self.file_iterator.lock().await;
            iterator.has_next().await.unwrap_or(true)
        };
        !has_next && self.retry_files.lock().is_empty() && self.running_tasks.lock().is_empty()
    }

    /// Set the job state to `FAILED` with the given reason.
    pub fn fail_job(&self, reason: &BlockStoreError) {
        *self.state.lock() = JobState::Failed;
        *self.failed_reason.lock() = Some(reason.to_string());
        *self.end_time_ms.lock() = Some(now_ms());
        LOAD_METRICS.job_load_fail_inc();
    }

    /// Set the job state to `SUCCEEDED`.
    pub fn set_job_success(&self) {
        *self.state.lock() = JobState::Succeeded;
        *self.end_time_ms.lock() = Some(now_ms());
        LOAD_METRICS.job_load_success_inc();
    }

    /// Queue a file for retry and count the failure. Returns `false` when
    /// the retry deque is at capacity.
    pub fn add_files_to_retry(&self, path: String) -> bool {
        debug!("retry file {path}");
        if !self.offer_retry(path) {
            return false;
        }
        self.total_failure_count.fetch_add(1, Ordering::AcqRel);
        LOAD_METRICS.job_load_file_fail_inc();
        true
    }

    /// Record a permanent file failure. When the same file fails more than
    /// once only the first reason is kept.
    pub fn add_file_failure(&self, path: &str, message: &str, code: u32) {
        self.failed_files
            .lock()
            .entry(path.to_owned())
            .or_insert_with(|| format!("Status code: {code}, message: {message}"));
        LOAD_METRICS.job_load_file_fail_inc();
    }

    /// The progress report of this job.
    ///
    /// # Errors
    /// Returns `Internal` when the report cannot be serialized.
    pub fn get_progress(
        &self,
        format: JobProgressReportFormat,
        verbose: bool,
    ) -> BlockStoreResult<String> {
        LoadProgressReport::new(self, verbose).report(format)
    }

    /// The journal entry persisting this job.
    #[must_use]
    pub fn to_journal_entry(&self) -> LoadJobJournalEntry {
        LoadJobJournalEntry {
            job_id: self.job_id.clone(),
            load_path: self.path.clone(),
            state: self.state(),
            partial_listing: self.use_partial_listing,
            verify: self.verification_enabled,
            user: self.user.clone(),
            bandwidth: self.bandwidth,
            end_time: *self.end_time_ms.lock(),
        }
    }

    /// Push to the retry deque, bounded by `RETRY_BLOCK_CAPACITY`.
    fn offer_retry(&self, path: String) -> bool {
        let mut retry_files = self.retry_files.lock();
        if retry_files.len() >= RETRY_BLOCK_CAPACITY {
            return false;
        }
        retry_files.push_back(path);
        true
    }
}
