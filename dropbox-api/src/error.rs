use serde::Deserialize;
use thiserror::Error;

/// Error envelope returned by the Dropbox API on non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error_summary: String,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Main error type for the Dropbox API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// API returned an error response
    #[error("API error ({status}): {summary}")]
    Api {
        status: u16,
        summary: String,
        detail: Option<serde_json::Value>,
    },

    /// The server no longer knows the upload session
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    /// Request hit the per-call timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Name resolution or connection failure
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Authentication failed or token invalid (401)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// HTTP request error not covered above
    #[error("HTTP request error: {0}")]
    Request(reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Build an error from a decoded API error envelope.
    ///
    /// `session_route` marks the upload-session routes, where a
    /// `not_found` summary means the server expired or forgot the session.
    pub fn from_response(status: u16, response: ErrorResponse, session_route: bool) -> Self {
        if status == 401 {
            return ApiError::Auth(response.error_summary);
        }
        if session_route && response.error_summary.contains("not_found") {
            return ApiError::SessionNotFound(response.error_summary);
        }
        ApiError::Api {
            status,
            summary: response.error_summary,
            detail: response.error,
        }
    }

    /// Timeout class: retried with no delay between attempts
    pub fn is_transient_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout(_))
    }

    /// Connection/DNS class: retried with linear backoff
    pub fn is_transient_connect(&self) -> bool {
        matches!(self, ApiError::Connect(_))
    }

    /// Either transient class
    pub fn is_transient(&self) -> bool {
        self.is_transient_timeout() || self.is_transient_connect()
    }

    /// The server-side upload session is gone; resume cannot continue
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, ApiError::SessionNotFound(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_connect() {
            ApiError::Connect(err.to_string())
        } else {
            ApiError::Request(err)
        }
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;
