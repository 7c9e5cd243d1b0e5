//! Wire types of the worker-side load RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::error::BlockStoreResult;

/// One file to load onto a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFile {
    /// The path of the file in the cache namespace.
    pub path: String,
    /// The length of the file in bytes.
    pub length: u64,
    /// The path of the file on the UFS.
    pub ufs_path: String,
}

/// Options attached to a load request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsReadOptions {
    /// The tag of the request, equal to the job id.
    pub tag: String,
    /// Whether short positioned reads should be used.
    pub position_short: bool,
    /// The bandwidth granted to the request, if limited.
    pub bandwidth: Option<u64>,
}

/// A request to load a batch of files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFileRequest {
    /// The files to load.
    pub files: Vec<LoadFile>,
    /// The request options.
    pub options: UfsReadOptions,
}

/// The outcome of a load task on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// All files were loaded.
    Success,
    /// No file was loaded.
    Failure,
    /// Some files were loaded.
    Partial,
}

/// One file a worker failed to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    /// The file that failed.
    pub file: LoadFile,
    /// The failure message.
    pub message: String,
    /// The numeric status code of the failure.
    pub code: u32,
    /// Whether the failure is worth retrying.
    pub retryable: bool,
}

/// The response of a load request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFileResponse {
    /// The outcome of the task.
    pub status: TaskStatus,
    /// The files that failed, empty on success.
    pub failures: Vec<FileFailure>,
}

/// A worker as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// The worker id.
    pub id: u64,
    /// The address of the worker.
    pub address: String,
}

/// An RPC client for dispatching load requests to one worker.
#[async_trait]
pub trait BlockWorkerClient: Send + Sync {
    /// Load a batch of files onto the worker.
    async fn load_file(&self, request: LoadFileRequest) -> BlockStoreResult<LoadFileResponse>;
}
