//! Minimal typed client for the Dropbox HTTP API.
//!
//! Covers the file operations the sync engine consumes: chunked upload
//! sessions, simple upload, recursive folder listing with pagination,
//! folder creation, batched deletes, revision listing and restore.

pub mod api;
pub mod client;
pub mod content_hash;
pub mod error;
pub mod models;

pub use client::Client;
pub use content_hash::ContentHasher;
pub use error::{ApiError, ApiResult};
