//! Storage recycling for deleted remote files.
//!
//! The cloud service keeps deleted files restorable for a limited window.
//! After every sync pass, tombstones aged between 15 and 29 days whose path
//! is free (no live file, parent folder still present) are restored to their
//! newest revision and immediately deleted again, refreshing the server-side
//! deletion clock. Re-deletes batch up to a size threshold so one poll
//! round-trip covers many small files.

use super::planner::{SyncPlan, parent_of};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dropbox_api::api::FilesApi;
use dropbox_api::models::files::{DeleteBatchJobStatus, DeleteBatchLaunch};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Youngest tombstone age considered, inclusive
const MIN_AGE_DAYS: i64 = 15;
/// Oldest tombstone age considered, inclusive
const MAX_AGE_DAYS: i64 = 29;

/// Accumulated restored bytes that force a batch flush
const BATCH_FLUSH_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Revisions fetched per tombstone
const REVISION_LIMIT: u64 = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Restore-and-redelete pass over the plan's tombstones
pub struct Recycler<'a, C: FilesApi> {
    client: &'a C,
    now: DateTime<Utc>,
}

impl<'a, C: FilesApi> Recycler<'a, C> {
    pub fn new(client: &'a C, now: DateTime<Utc>) -> Self {
        Self { client, now }
    }

    pub async fn run(&self, plan: &SyncPlan) -> Result<()> {
        let mut batch: Vec<String> = Vec::new();
        let mut batch_bytes: u64 = 0;

        for entry in &plan.deleted_entries {
            // A live file took the path back, or the parent folder is gone
            if plan.existing_files.contains_key(&entry.rel_lower) {
                continue;
            }
            if !plan.existing_folders.contains(parent_of(&entry.rel_lower)) {
                continue;
            }

            let revisions = match self
                .client
                .list_revisions(&entry.remote_path, REVISION_LIMIT)
                .await
            {
                Ok(revisions) => revisions,
                Err(e) => {
                    warn!(
                        target: "sync::recycler",
                        path = %entry.remote_path,
                        error = %e,
                        "failed to list revisions, skipping"
                    );
                    continue;
                }
            };

            let Some(server_deleted) = revisions.server_deleted else {
                continue;
            };
            if !in_window(self.now, server_deleted) {
                debug!(
                    target: "sync::recycler",
                    path = %entry.remote_path,
                    deleted = %server_deleted,
                    "outside the recycle window"
                );
                continue;
            }

            let Some(newest) = revisions
                .entries
                .iter()
                .max_by_key(|rev| rev.client_modified)
            else {
                continue;
            };

            info!(
                target: "sync::recycler",
                path = %entry.remote_path,
                rev = %newest.rev,
                "restoring deleted file to refresh its retention clock"
            );
            let restored = self
                .client
                .restore(&entry.remote_path, &newest.rev)
                .await
                .with_context(|| format!("failed to restore {}", entry.remote_path))?;

            if restored.size >= BATCH_FLUSH_BYTES && batch.is_empty() {
                delete_and_wait(self.client, vec![entry.remote_path.clone()]).await?;
                continue;
            }

            batch.push(entry.remote_path.clone());
            batch_bytes += restored.size;
            if batch_bytes >= BATCH_FLUSH_BYTES {
                delete_and_wait(self.client, std::mem::take(&mut batch)).await?;
                batch_bytes = 0;
            }
        }

        delete_and_wait(self.client, batch).await
    }
}

/// Whether a tombstone's age falls inside `[15 days, 29 days]`
fn in_window(now: DateTime<Utc>, server_deleted: DateTime<Utc>) -> bool {
    let age = now - server_deleted;
    age >= ChronoDuration::days(MIN_AGE_DAYS) && age <= ChronoDuration::days(MAX_AGE_DAYS)
}

/// Launch a batch delete and poll the job to completion
pub async fn delete_and_wait<C: FilesApi>(client: &C, paths: Vec<String>) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }

    info!(target: "sync::recycler", count = paths.len(), "deleting batch");
    let launch = client
        .delete_batch(paths)
        .await
        .context("failed to launch batch delete")?;

    let job_id = match launch {
        DeleteBatchLaunch::Complete {} => return Ok(()),
        DeleteBatchLaunch::AsyncJobId { async_job_id } => async_job_id,
        DeleteBatchLaunch::Other => bail!("unrecognized delete_batch response"),
    };

    loop {
        match client
            .delete_batch_check(&job_id)
            .await
            .context("failed to poll batch delete")?
        {
            DeleteBatchJobStatus::InProgress => {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            DeleteBatchJobStatus::Complete {} => return Ok(()),
            DeleteBatchJobStatus::Failed => bail!("batch delete failed"),
        }
    }
}
