//! The block store related error.

use thiserror::Error;

/// The result of block store operation.
pub type BlockStoreResult<T> = Result<T, BlockStoreError>;

/// An error occurs in block store operation.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    /// A block or page is absent when it is required to exist
    #[error("{0} not found")]
    NotFound(String),
    /// An attempt to create a block id that is already known
    #[error("Block {0} already exists")]
    AlreadyExists(u64),
    /// An illegal state transition, indicates a caller bug
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// No directory has enough free capacity
    #[error("No dir has {0} bytes of free capacity")]
    ResourceExhausted(u64),
    /// A lock is not acquired within its timeout
    #[error("{0}")]
    DeadlineExceeded(String),
    /// The block master cannot be reached
    #[error("Master unavailable: {0}")]
    Unavailable(String),
    /// The requested range is out of the block bounds
    #[error("{found} is out of range of {maximum}")]
    OutOfRange {
        /// The maximum size of the operated block
        maximum: u64,
        /// The size or offset found in argument
        found: u64,
    },
    /// An error caused by [`std::io::Error`]
    #[error("{0}")]
    StdIoError(#[from] std::io::Error),
    /// An error caused by [`opendal::Error`]
    #[error("{0}")]
    OpenDalError(#[from] opendal::Error),
    /// A internal block store error.
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl BlockStoreError {
    /// The numeric status code of this error, following the gRPC status
    /// code space so it can travel in `FileFailure.code`.
    #[must_use]
    pub fn status_code(&self) -> u32 {
        match *self {
            Self::DeadlineExceeded(_) => 4,
            Self::NotFound(_) => 5,
            Self::AlreadyExists(_) => 6,
            Self::ResourceExhausted(_) => 8,
            Self::InvalidState(_) => 9,
            Self::OutOfRange { .. } => 11,
            Self::Unavailable(_) => 14,
            Self::StdIoError(_) | Self::OpenDalError(_) | Self::Internal(_) => 13,
        }
    }

    /// Whether an operation that failed with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            *self,
            Self::Unavailable(_)
                | Self::DeadlineExceeded(_)
                | Self::ResourceExhausted(_)
                | Self::StdIoError(_)
                | Self::OpenDalError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        assert_eq!(BlockStoreError::NotFound("block 1".to_owned()).status_code(), 5);
        assert_eq!(BlockStoreError::AlreadyExists(1).status_code(), 6);
        assert_eq!(
            BlockStoreError::Unavailable("commit".to_owned()).status_code(),
            14
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BlockStoreError::Unavailable("master".to_owned()).is_retryable());
        assert!(!BlockStoreError::AlreadyExists(1).is_retryable());
        assert!(!BlockStoreError::InvalidState("temp".to_owned()).is_retryable());
    }
}
