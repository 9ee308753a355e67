//! Request and response models for the `files` namespace.
//!
//! Only the fields the sync engine consumes are modeled. Unions follow the
//! Dropbox `.tag` convention.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Format a timestamp the way the API expects (`%Y-%m-%dT%H:%M:%SZ`)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Conflict resolution mode for commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Add,
    Overwrite,
}

/// Commit metadata for `upload` and `upload_session/finish`
#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    /// Destination path, forward-slash separated, leading slash
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_modified: Option<String>,
}

impl CommitInfo {
    pub fn new(path: String, client_modified: &DateTime<Utc>) -> Self {
        Self {
            path,
            mode: WriteMode::Overwrite,
            autorename: false,
            client_modified: Some(format_timestamp(client_modified)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionStartArg {
    pub close: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSessionStartResult {
    pub session_id: String,
}

/// Position within an upload session
#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionCursor {
    pub session_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionAppendArg {
    pub cursor: UploadSessionCursor,
    pub close: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionFinishArg {
    pub cursor: UploadSessionCursor,
    pub commit: CommitInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadArg {
    #[serde(flatten)]
    pub commit: CommitInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A file entry as returned by listing and upload routes
#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_lower: Option<String>,
    pub path_display: Option<String>,
    pub client_modified: DateTime<Utc>,
    pub server_modified: DateTime<Utc>,
    pub rev: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderMetadata {
    pub name: String,
    pub path_lower: Option<String>,
    pub path_display: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletedMetadata {
    pub name: String,
    pub path_lower: Option<String>,
    pub path_display: Option<String>,
}

/// One listing entry; the variant tag distinguishes files, folders and
/// tombstones (visible when listing with `include_deleted`)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn path_lower(&self) -> Option<&str> {
        match self {
            Metadata::File(f) => f.path_lower.as_deref(),
            Metadata::Folder(f) => f.path_lower.as_deref(),
            Metadata::Deleted(d) => d.path_lower.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListFolderArg {
    pub path: String,
    pub recursive: bool,
    pub include_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListFolderContinueArg {
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFolderArg {
    pub path: String,
    pub autorename: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteArg {
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteBatchArg {
    pub entries: Vec<DeleteArg>,
}

/// Result of launching a batch delete: either done inline or queued
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum DeleteBatchLaunch {
    AsyncJobId { async_job_id: String },
    Complete {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollArg {
    pub async_job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum DeleteBatchJobStatus {
    InProgress,
    Complete {},
    #[serde(other)]
    Failed,
}

/// Revision selection mode for `list_revisions`
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListRevisionsMode {
    Path,
    Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRevisionsArg {
    pub path: String,
    pub mode: ListRevisionsMode,
    pub limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRevisionsResult {
    pub is_deleted: bool,
    /// Present when the file is currently deleted
    pub server_deleted: Option<DateTime<Utc>>,
    pub entries: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreArg {
    pub path: String,
    pub rev: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn commit_timestamp_has_second_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(format_timestamp(&ts), "2024-03-05T12:30:45Z");
    }

    #[test]
    fn listing_entries_deserialize_by_tag() {
        let json = r#"{
            "entries": [
                {".tag": "file", "name": "a.txt", "path_lower": "/a.txt",
                 "path_display": "/a.txt", "rev": "0123456789abcdef01234",
                 "client_modified": "2024-01-02T03:04:05Z",
                 "server_modified": "2024-01-02T03:04:06Z", "size": 42},
                {".tag": "folder", "name": "sub", "path_lower": "/sub",
                 "path_display": "/sub"},
                {".tag": "deleted", "name": "gone.bin", "path_lower": "/gone.bin",
                 "path_display": "/gone.bin"}
            ],
            "cursor": "AAA", "has_more": false
        }"#;
        let result: ListFolderResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.entries.len(), 3);
        assert!(matches!(result.entries[0], Metadata::File(ref f) if f.size == 42));
        assert!(matches!(result.entries[1], Metadata::Folder(_)));
        assert!(matches!(result.entries[2], Metadata::Deleted(_)));
    }

    #[test]
    fn delete_batch_launch_variants() {
        let launch: DeleteBatchLaunch =
            serde_json::from_str(r#"{".tag": "async_job_id", "async_job_id": "x"}"#).unwrap();
        assert!(matches!(launch, DeleteBatchLaunch::AsyncJobId { ref async_job_id } if async_job_id == "x"));

        let status: DeleteBatchJobStatus =
            serde_json::from_str(r#"{".tag": "in_progress"}"#).unwrap();
        assert!(matches!(status, DeleteBatchJobStatus::InProgress));
    }

    #[test]
    fn content_hash_omitted_when_absent() {
        let arg = UploadSessionStartArg {
            close: false,
            content_hash: None,
        };
        let json = serde_json::to_string(&arg).unwrap();
        assert!(!json.contains("content_hash"));
    }
}
