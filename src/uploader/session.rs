//! Upload session persistence for cross-process resume.
//!
//! A single record per local-directory scope is kept as a JSON file in the
//! per-user application-data directory. The file name is derived from a hash
//! of the lowercase directory path so concurrent processes syncing distinct
//! directories never collide on the slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const APP_DIR: &str = "DropboxEncryptedUploader";
const FILE_PREFIX: &str = "session-";
const FILE_SUFFIX: &str = ".json";

/// Records older than this are swept at startup; kept conservatively below
/// the server-side session TTL
const RETENTION: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// On-disk resume token for one in-progress upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier issued by the cloud service
    pub session_id: String,
    /// Absolute local path of the file being uploaded
    pub file_path: String,
    /// Client-modified timestamp of that file at session start
    pub client_modified: DateTime<Utc>,
    /// Byte length of that file at session start
    pub total_size: u64,
    /// Producer-stream bytes consumed through the last uploaded chunk
    pub current_offset: u64,
    /// Hex-encoded 16-byte archive salt; absent for direct uploads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_salt: Option<String>,
    /// Cumulative chain hash (64 hex chars) through `current_offset`
    pub content_hash: String,
}

impl SessionRecord {
    /// Whether this record may resume an upload of the given file.
    ///
    /// The path, size and timestamp must all match what was recorded at
    /// session start, and the chain hash must be present; anything else
    /// means the file changed and the record is stale.
    pub fn matches(
        &self,
        file_path: &str,
        total_size: u64,
        client_modified: &DateTime<Utc>,
    ) -> bool {
        self.file_path == file_path
            && self.total_size == total_size
            && self.client_modified == *client_modified
            && !self.content_hash.is_empty()
    }

    /// Decode the stored salt, if any
    pub fn salt_bytes(&self) -> Option<[u8; 16]> {
        let hex_salt = self.encryption_salt.as_deref()?;
        let decoded = hex::decode(hex_salt).ok()?;
        decoded.try_into().ok()
    }
}

/// Single-slot store for [`SessionRecord`]s, one slot per directory scope
pub struct SessionStore {
    dir: PathBuf,
    path: PathBuf,
}

impl SessionStore {
    /// Open the store for a local directory scope in the per-user
    /// application-data directory
    pub fn open(local_root: &Path) -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::with_base_dir(base, local_root)
    }

    /// Open the store under an explicit base directory
    pub fn with_base_dir(base: PathBuf, local_root: &Path) -> Self {
        let name = format!("{FILE_PREFIX}{}{FILE_SUFFIX}", scope_key(local_root));
        let path = base.join(name);
        Self { dir: base, path }
    }

    /// Load the stored record. Corrupt or unreadable storage logs a warning
    /// and yields `None`; it never fails the upload.
    pub async fn load(&self) -> Option<SessionRecord> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "uploader::session", error = %e, "failed to read session record");
                return None;
            }
        };

        match serde_json::from_slice::<SessionRecord>(&data) {
            Ok(record) => {
                debug!(
                    target: "uploader::session",
                    session_id = %record.session_id,
                    current_offset = record.current_offset,
                    "loaded session record"
                );
                Some(record)
            }
            Err(e) => {
                warn!(target: "uploader::session", error = %e, "corrupt session record, ignoring");
                None
            }
        }
    }

    /// Atomically replace the stored record. Failure is logged and swallowed:
    /// the current run continues, only crash-resume is lost.
    pub async fn save(&self, record: &SessionRecord) {
        if let Err(e) = self.try_save(record).await {
            warn!(target: "uploader::session", error = %e, "failed to persist session record");
        }
    }

    async fn try_save(&self, record: &SessionRecord) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Write-then-rename so a concurrent reader never observes a torn record
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Remove the record. Idempotent; errors ignored.
    pub async fn delete(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(target: "uploader::session", "session record deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: "uploader::session", error = %e, "failed to delete session record");
            }
        }
    }

    /// Delete records in the store directory that outlived the retention
    /// window. Runs at startup; sweeps all scopes, not just this one.
    pub async fn sweep_expired(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let cutoff = SystemTime::now() - RETENTION;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }

            let expired = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);

            if expired {
                debug!(target: "uploader::session", file = name, "sweeping expired session record");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

/// First 32 hex characters of SHA-256 of the lowercase directory path
fn scope_key(local_root: &Path) -> String {
    let lowered = local_root.to_string_lossy().to_lowercase();
    let digest = Sha256::digest(lowered.as_bytes());
    hex::encode(digest)[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: "sess-1".to_string(),
            file_path: "/data/big.bin".to_string(),
            client_modified: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            total_size: 1000,
            current_offset: 300,
            encryption_salt: Some(hex::encode([7u8; 16])),
            content_hash: "ab".repeat(32),
        }
    }

    fn store(tmp: &TempDir) -> SessionStore {
        SessionStore::with_base_dir(tmp.path().join("store"), Path::new("/data"))
    }

    #[test]
    fn scope_key_is_lowercase_insensitive_and_32_chars() {
        let a = scope_key(Path::new("/Data/Photos"));
        let b = scope_key(Path::new("/data/photos"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, scope_key(Path::new("/data/other")));
    }

    #[test]
    fn record_match_rules() {
        let r = record();
        let ts = r.client_modified;
        assert!(r.matches("/data/big.bin", 1000, &ts));
        assert!(!r.matches("/data/other.bin", 1000, &ts));
        assert!(!r.matches("/data/big.bin", 999, &ts));
        assert!(!r.matches(
            "/data/big.bin",
            1000,
            &(ts + chrono::Duration::milliseconds(1))
        ));

        let mut empty_hash = record();
        empty_hash.content_hash.clear();
        assert!(!empty_hash.matches("/data/big.bin", 1000, &ts));
    }

    #[test]
    fn salt_round_trips_through_hex() {
        let r = record();
        assert_eq!(r.salt_bytes(), Some([7u8; 16]));

        let mut bad = record();
        bad.encryption_salt = Some("zz".to_string());
        assert_eq!(bad.salt_bytes(), None);

        let mut short = record();
        short.encryption_salt = Some("aabb".to_string());
        assert_eq!(short.salt_bytes(), None);
    }

    #[tokio::test]
    async fn save_load_delete_cycle() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        assert!(store.load().await.is_none());

        let r = record();
        store.save(&r).await;
        assert_eq!(store.load().await, Some(r.clone()));

        // save replaces the slot
        let mut r2 = r.clone();
        r2.current_offset = 600;
        store.save(&r2).await;
        assert_eq!(store.load().await, Some(r2));

        store.delete().await;
        assert!(store.load().await.is_none());
        // idempotent
        store.delete().await;
    }

    #[tokio::test]
    async fn corrupt_record_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.save(&record()).await;

        let path = tmp.path().join("store").join(
            std::fs::read_dir(tmp.path().join("store"))
                .unwrap()
                .next()
                .unwrap()
                .unwrap()
                .file_name(),
        );
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn distinct_scopes_use_distinct_slots() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("store");
        let a = SessionStore::with_base_dir(base.clone(), Path::new("/data/a"));
        let b = SessionStore::with_base_dir(base, Path::new("/data/b"));

        a.save(&record()).await;
        assert!(b.load().await.is_none());
        assert!(a.load().await.is_some());
    }
}
