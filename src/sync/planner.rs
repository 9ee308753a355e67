//! Local-tree vs remote-listing diff.
//!
//! The planner walks the local directory, pulls the recursive remote listing
//! (deleted entries included), and produces the upload queue, the remote
//! deletion set, and the folder/tombstone indexes the engine and recycler
//! consume. Remote paths compare case-insensitively with forward slashes;
//! a file whose remote counterpart matches within one second of the local
//! modification time is considered in sync and omitted.

use crate::uploader::{FileJob, truncate_to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dropbox_api::api::FilesApi;
use dropbox_api::models::files::{ListFolderArg, Metadata};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Timestamp slack below which a remote file counts as up to date
const MODIFIED_TOLERANCE_SECS: i64 = 1;

/// Page size for the recursive listing
const LIST_LIMIT: u32 = 2000;

/// Remote suffix appended when files are wrapped in an encrypted archive
pub const ARCHIVE_SUFFIX: &str = ".zip";

/// A file found in the local tree
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Path relative to the sync root, forward-slash separated
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A tombstone from the remote listing
#[derive(Debug, Clone)]
pub struct DeletedEntry {
    /// Lowercase path relative to the remote root
    pub rel_lower: String,
    /// Full remote path as displayed
    pub remote_path: String,
}

/// Everything the engine needs to drive one sync pass
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Files to upload, in local-walk order
    pub jobs: Vec<FileJob>,
    /// Full remote paths to delete
    pub deletions: Vec<String>,
    /// Remote folders to create, parents before children
    pub folders_to_create: Vec<String>,
    /// Lowercase relative path → remote client-modified time
    pub existing_files: HashMap<String, DateTime<Utc>>,
    /// Lowercase relative folder paths; `""` is the root
    pub existing_folders: HashSet<String>,
    /// Tombstones visible in the listing
    pub deleted_entries: Vec<DeletedEntry>,
}

/// Walk the local tree in deterministic lexicographic order
pub fn scan_local(root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<LocalFile>) -> Result<()> {
    let mut entries: BTreeMap<String, PathBuf> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        entries.insert(entry.file_name().to_string_lossy().to_string(), entry.path());
    }

    for (_, path) in entries {
        let meta = std::fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if meta.is_dir() {
            walk(root, &path, out)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under the root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let modified: DateTime<Utc> = meta
                .modified()
                .with_context(|| format!("no modification time for {}", path.display()))?
                .into();
            out.push(LocalFile {
                rel_path: rel,
                abs_path: path,
                size: meta.len(),
                modified: truncate_to_millis(modified),
            });
        }
        // symlinks and other specials are not synced
    }
    Ok(())
}

/// Index of the remote tree built from listing entries
#[derive(Debug, Default)]
pub struct RemoteIndex {
    pub files: HashMap<String, (String, DateTime<Utc>)>,
    pub folders: HashSet<String>,
    pub deleted: Vec<DeletedEntry>,
}

impl RemoteIndex {
    /// Fold listing entries into the index. `root_lower` is the lowercase
    /// remote root used to relativize entry paths.
    pub fn ingest(&mut self, entries: &[Metadata], root_lower: &str) {
        for entry in entries {
            let Some(lower) = entry.path_lower() else { continue };
            let Some(rel) = relativize(lower, root_lower) else { continue };

            match entry {
                Metadata::File(f) => {
                    let display = f.path_display.clone().unwrap_or_else(|| lower.to_string());
                    self.files.insert(rel, (display, f.client_modified));
                }
                Metadata::Folder(_) => {
                    self.folders.insert(rel);
                }
                Metadata::Deleted(d) => {
                    let display = d.path_display.clone().unwrap_or_else(|| lower.to_string());
                    self.deleted.push(DeletedEntry {
                        rel_lower: rel,
                        remote_path: display,
                    });
                }
            }
        }
    }
}

fn relativize(path_lower: &str, root_lower: &str) -> Option<String> {
    if root_lower.is_empty() {
        return Some(path_lower.trim_start_matches('/').to_string());
    }
    let rest = path_lower.strip_prefix(root_lower)?;
    Some(rest.trim_start_matches('/').to_string())
}

/// Fetch the recursive remote listing, following the cursor to the end
pub async fn list_remote<C: FilesApi>(client: &C, remote_root: &str) -> Result<RemoteIndex> {
    let root_lower = remote_root.to_lowercase();
    let mut index = RemoteIndex::default();

    let mut page = client
        .list_folder(&ListFolderArg {
            path: remote_root.to_string(),
            recursive: true,
            include_deleted: true,
            limit: Some(LIST_LIMIT),
        })
        .await
        .context("failed to list remote folder")?;
    index.ingest(&page.entries, &root_lower);

    while page.has_more {
        page = client
            .list_folder_continue(&page.cursor)
            .await
            .context("failed to continue remote listing")?;
        index.ingest(&page.entries, &root_lower);
    }

    Ok(index)
}

/// Compute the sync plan from the local walk and the remote index
pub fn diff(
    local: Vec<LocalFile>,
    remote: RemoteIndex,
    remote_root: &str,
    encrypt: bool,
) -> SyncPlan {
    let mut plan = SyncPlan {
        existing_folders: remote.folders,
        deleted_entries: remote.deleted,
        ..SyncPlan::default()
    };
    plan.existing_folders.insert(String::new());

    let mut local_keys: HashSet<String> = HashSet::new();
    let mut wanted_folders: Vec<String> = Vec::new();

    for file in local {
        let remote_rel = if encrypt {
            format!("{}{ARCHIVE_SUFFIX}", file.rel_path)
        } else {
            file.rel_path.clone()
        };
        let key = remote_rel.to_lowercase();
        local_keys.insert(key.clone());

        let up_to_date = remote.files.get(&key).is_some_and(|(_, remote_modified)| {
            (file.modified - *remote_modified)
                .num_seconds()
                .abs()
                <= MODIFIED_TOLERANCE_SECS
        });
        if up_to_date {
            debug!(target: "sync", rel = %file.rel_path, "in sync, skipping");
            continue;
        }

        for ancestor in ancestors(&key) {
            if !plan.existing_folders.contains(&ancestor) && !wanted_folders.contains(&ancestor) {
                wanted_folders.push(ancestor);
            }
        }

        plan.jobs.push(FileJob {
            source_path: file.abs_path,
            remote_path: join_remote(remote_root, &remote_rel),
            total_size: file.size,
            client_modified: file.modified,
        });
    }

    for (key, (display, _)) in &remote.files {
        if !local_keys.contains(key) {
            plan.deletions.push(display.clone());
        }
    }
    plan.deletions.sort();

    wanted_folders.sort();
    plan.folders_to_create = wanted_folders
        .into_iter()
        .map(|rel| join_remote(remote_root, &rel))
        .collect();

    plan.existing_files = remote
        .files
        .into_iter()
        .map(|(k, (_, modified))| (k, modified))
        .collect();

    info!(
        target: "sync",
        uploads = plan.jobs.len(),
        deletions = plan.deletions.len(),
        folders = plan.folders_to_create.len(),
        "sync plan ready"
    );
    plan
}

/// Build the full plan for one local/remote root pair
pub async fn build_plan<C: FilesApi>(
    client: &C,
    local_root: &Path,
    remote_root: &str,
    encrypt: bool,
) -> Result<SyncPlan> {
    let local = scan_local(local_root)?;
    info!(target: "sync", files = local.len(), "local scan complete");
    let remote = list_remote(client, remote_root).await?;
    Ok(diff(local, remote, remote_root, encrypt))
}

/// Proper ancestors of a relative path, nearest root first, root excluded
fn ancestors(rel: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    let parts: Vec<&str> = rel.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

/// Parent of a relative lowercase path; `""` for top-level entries
pub fn parent_of(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn join_remote(remote_root: &str, rel: &str) -> String {
    if remote_root.is_empty() {
        format!("/{rel}")
    } else {
        format!("{remote_root}/{rel}")
    }
}
