//! Directory synchronization: plan, upload, delete, recycle.

mod planner;
mod recycler;

pub use planner::{ARCHIVE_SUFFIX, DeletedEntry, LocalFile, RemoteIndex, SyncPlan, build_plan};
pub use recycler::{Recycler, delete_and_wait};

use crate::uploader::{ProgressCallback, Uploader};
use anyhow::{Context, Result};
use chrono::Utc;
use dropbox_api::api::FilesApi;
use std::path::Path;
use tracing::{debug, info};

/// One full sync pass: diff the trees, create missing folders, upload the
/// queue, delete remote strays, then give the recycler its turn.
pub async fn run_sync<C: FilesApi>(
    client: &C,
    uploader: &mut Uploader<C>,
    local_root: &Path,
    remote_root: &str,
    encrypt: bool,
    progress: &impl ProgressCallback,
) -> Result<()> {
    let mut plan = build_plan(client, local_root, remote_root, encrypt).await?;

    for folder in &plan.folders_to_create {
        // Creation races with concurrent clients are benign; the folder
        // either exists afterwards or the upload will surface a real error
        if let Err(e) = client.create_folder(folder).await {
            debug!(target: "sync", folder = %folder, error = %e, "create_folder ignored an error");
        }
    }

    let jobs = std::mem::take(&mut plan.jobs);
    if jobs.is_empty() {
        info!(target: "sync", "nothing to upload");
    } else {
        uploader
            .upload_all(jobs, progress)
            .await
            .context("upload queue failed")?;
    }

    let deletions = std::mem::take(&mut plan.deletions);
    delete_and_wait(client, deletions)
        .await
        .context("remote deletions failed")?;

    Recycler::new(client, Utc::now())
        .run(&plan)
        .await
        .context("storage recycling failed")?;

    Ok(())
}
