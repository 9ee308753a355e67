//! Error types for the uploader module

use dropbox_api::ApiError;
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types
#[derive(Debug, Error)]
pub enum UploadError {
    /// Resume could not continue; the saved session record has been deleted
    /// and the caller should restart the file from scratch
    #[error("Resume failed: {0}")]
    ResumeFailed(String),

    /// A cloud call failed after exhausting its retry budget
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ApiError,
    },

    /// Cloud service error outside the retryable classes
    #[error("Cloud error: {0}")]
    Cloud(#[from] ApiError),

    /// Failed to read a local file
    #[error("Failed to read local file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Encryption stage failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Driver invoked outside its state machine contract
    #[error("Invalid driver state: {0}")]
    InvalidState(String),
}

impl UploadError {
    /// Resume-failure errors delete the session record before surfacing;
    /// the outer controller restarts the file fresh
    pub fn is_resume_failure(&self) -> bool {
        matches!(self, UploadError::ResumeFailed(_))
    }

    pub fn resume_failed(message: impl Into<String>) -> Self {
        UploadError::ResumeFailed(message.into())
    }
}
