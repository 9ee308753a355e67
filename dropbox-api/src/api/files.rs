//! File operations consumed by the sync engine.
//!
//! The trait exists as a seam: the upload driver is generic over [`FilesApi`]
//! so its resume protocol can be exercised against a scripted fake.

use crate::client::Client;
use crate::error::ApiResult;
use crate::models::files::*;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait FilesApi: Send + Sync {
    /// Open an upload session with the first chunk
    async fn upload_session_start(
        &self,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<String>;

    /// Append a chunk at the given server offset
    async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<()>;

    /// Commit the session with the final chunk
    async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        commit: CommitInfo,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<FileMetadata>;

    /// Single-shot upload for payloads that never opened a session
    async fn upload(
        &self,
        commit: CommitInfo,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<FileMetadata>;

    /// First page of a folder listing
    async fn list_folder(&self, arg: &ListFolderArg) -> ApiResult<ListFolderResult>;

    /// Subsequent pages
    async fn list_folder_continue(&self, cursor: &str) -> ApiResult<ListFolderResult>;

    /// Create a folder; conflict errors are the caller's to swallow
    async fn create_folder(&self, path: &str) -> ApiResult<()>;

    /// Launch a batch delete
    async fn delete_batch(&self, paths: Vec<String>) -> ApiResult<DeleteBatchLaunch>;

    /// Poll a batch delete job
    async fn delete_batch_check(&self, async_job_id: &str) -> ApiResult<DeleteBatchJobStatus>;

    /// Revisions of a path, newest first by server ordering
    async fn list_revisions(&self, path: &str, limit: u64) -> ApiResult<ListRevisionsResult>;

    /// Restore a path to a given revision
    async fn restore(&self, path: &str, rev: &str) -> ApiResult<FileMetadata>;
}

#[async_trait]
impl FilesApi for Client {
    async fn upload_session_start(
        &self,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<String> {
        let arg = UploadSessionStartArg {
            close: false,
            content_hash,
        };
        let result: UploadSessionStartResult = self
            .content("files/upload_session/start", &arg, data, true)
            .await?;
        Ok(result.session_id)
    }

    async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<()> {
        let arg = UploadSessionAppendArg {
            cursor: UploadSessionCursor {
                session_id: session_id.to_string(),
                offset,
            },
            close: false,
            content_hash,
        };
        self.content("files/upload_session/append_v2", &arg, data, true)
            .await
    }

    async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        commit: CommitInfo,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<FileMetadata> {
        let arg = UploadSessionFinishArg {
            cursor: UploadSessionCursor {
                session_id: session_id.to_string(),
                offset,
            },
            commit,
            content_hash,
        };
        self.content("files/upload_session/finish", &arg, data, true)
            .await
    }

    async fn upload(
        &self,
        commit: CommitInfo,
        data: Bytes,
        content_hash: Option<String>,
    ) -> ApiResult<FileMetadata> {
        let arg = UploadArg {
            commit,
            content_hash,
        };
        self.content("files/upload", &arg, data, false).await
    }

    async fn list_folder(&self, arg: &ListFolderArg) -> ApiResult<ListFolderResult> {
        self.rpc("files/list_folder", arg).await
    }

    async fn list_folder_continue(&self, cursor: &str) -> ApiResult<ListFolderResult> {
        let arg = ListFolderContinueArg {
            cursor: cursor.to_string(),
        };
        self.rpc("files/list_folder/continue", &arg).await
    }

    async fn create_folder(&self, path: &str) -> ApiResult<()> {
        let arg = CreateFolderArg {
            path: path.to_string(),
            autorename: false,
        };
        // The response body (folder metadata) is not consumed
        let _: serde_json::Value = self.rpc("files/create_folder_v2", &arg).await?;
        Ok(())
    }

    async fn delete_batch(&self, paths: Vec<String>) -> ApiResult<DeleteBatchLaunch> {
        let arg = DeleteBatchArg {
            entries: paths.into_iter().map(|path| DeleteArg { path }).collect(),
        };
        self.rpc("files/delete_batch", &arg).await
    }

    async fn delete_batch_check(&self, async_job_id: &str) -> ApiResult<DeleteBatchJobStatus> {
        let arg = PollArg {
            async_job_id: async_job_id.to_string(),
        };
        self.rpc_long_poll("files/delete_batch/check", &arg).await
    }

    async fn list_revisions(&self, path: &str, limit: u64) -> ApiResult<ListRevisionsResult> {
        let arg = ListRevisionsArg {
            path: path.to_string(),
            mode: ListRevisionsMode::Path,
            limit,
        };
        self.rpc("files/list_revisions", &arg).await
    }

    async fn restore(&self, path: &str, rev: &str) -> ApiResult<FileMetadata> {
        let arg = RestoreArg {
            path: path.to_string(),
            rev: rev.to_string(),
        };
        self.rpc("files/restore", &arg).await
    }
}
