//! Streaming upload pipeline for Dropbox with resumable sessions.
//!
//! One file at a time flows through a bounded pipeline: a double-buffered
//! reader, an optional encrypting archive stage, a fixed-capacity chunk
//! accumulator, and the session driver that talks to the cloud. The driver
//! persists just enough state after every uploaded chunk that an interrupted
//! run, even across a process crash, resumes byte-accurate, verified by a
//! cumulative hash chain over the producer stream.

mod accumulator;
mod archive;
mod error;
mod progress;
mod reader;
mod session;

pub use accumulator::{ChunkAccumulator, DEFAULT_CAPACITY, DEFAULT_CHUNK_SIZE};
pub use archive::{ArchiveWriter, SALT_LEN, SaltSource};
pub use error::{UploadError, UploadResult};
pub use progress::{ConsoleProgress, NoOpProgress, ProgressCallback, ProgressTracker, ProgressUpdate};
pub use reader::{DEFAULT_READ_BUFFER_SIZE, FileReader};
pub use session::{SessionRecord, SessionStore};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use dropbox_api::api::FilesApi;
use dropbox_api::content_hash::content_hash;
use dropbox_api::models::files::CommitInfo;
use dropbox_api::ApiError;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Granularity of writes from the encrypt stage into the accumulator, so
/// chunk boundaries stay fine-grained against 90-MB read blocks
const CIPHER_SLICE: usize = 64 * 1024;

/// Configuration for the uploader
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Chunk boundary for session uploads
    pub chunk_size: usize,
    /// Accumulator arena capacity (chunk size plus framing headroom)
    pub arena_capacity: usize,
    /// Read arena size for the file reader
    pub read_buffer_size: usize,
    /// Attempts per cloud call before giving up
    pub max_call_retries: u32,
    /// Additional whole-file attempts after a failure
    pub max_file_retries: u32,
    /// Backoff unit for the connection-failure class
    pub retry_delay_unit: Duration,
    /// Archive password; `None` uploads files unwrapped
    pub password: Option<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            arena_capacity: DEFAULT_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_call_retries: 10,
            max_file_retries: 3,
            retry_delay_unit: Duration::from_secs(1),
            password: None,
        }
    }
}

/// One unit of upload, immutable after creation
#[derive(Debug, Clone)]
pub struct FileJob {
    /// Absolute local path
    pub source_path: PathBuf,
    /// Remote destination, forward-slash separated, `.zip` suffix when
    /// encrypting
    pub remote_path: String,
    /// Source byte length
    pub total_size: u64,
    /// Local modification time, UTC, millisecond precision
    pub client_modified: DateTime<Utc>,
}

impl FileJob {
    /// Build a job from local file metadata
    pub async fn from_path(
        source_path: PathBuf,
        remote_path: String,
    ) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(&source_path).await?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Self {
            source_path,
            remote_path,
            total_size: meta.len(),
            client_modified: truncate_to_millis(modified),
        })
    }

    fn path_string(&self) -> String {
        self.source_path.to_string_lossy().to_string()
    }
}

/// Clamp a timestamp to millisecond precision so it compares stably across
/// runs and against the session record
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis()).unwrap()
}

/// Driver state machine, per file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Idle,
    Prepared,
    /// Replaying chunks below the recorded resume offset
    ChunkingBeforeResume,
    /// Chain hash matched the record at the resume point
    Verified,
    Uploading,
}

/// Transient per-file pipeline state; created by `prepare`, cleared by
/// `finish` and on fatal exit
struct PipelineState {
    status: DriverState,
    /// Bytes acknowledged by the cloud in the current session
    upload_offset: u64,
    /// Producer-stream bytes folded into the hash chain
    local_offset: u64,
    /// Snapshot of the record's offset at prepare; zero for fresh uploads
    resume_offset: u64,
    active_session: Option<String>,
    hash_state: [u8; 32],
    hash_verified: bool,
    saved_hash: Option<String>,
    saved_salt: Option<[u8; SALT_LEN]>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            status: DriverState::Idle,
            upload_offset: 0,
            local_offset: 0,
            resume_offset: 0,
            active_session: None,
            hash_state: [0u8; 32],
            hash_verified: false,
            saved_hash: None,
            saved_salt: None,
        }
    }
}

/// Extend the chain: `h ← SHA256(h ∥ chunk)`.
///
/// This is an equality witness over a prefix of the producer stream, distinct
/// from the per-call content hash the cloud service verifies payloads with.
fn chain_hash(prev: &[u8; 32], chunk: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(chunk);
    hasher.finalize().into()
}

/// Chunked-upload driver
pub struct Uploader<C: FilesApi> {
    client: Arc<C>,
    store: SessionStore,
    config: UploaderConfig,
    state: PipelineState,
    current: Option<FileJob>,
}

impl<C: FilesApi> Uploader<C> {
    pub fn new(client: Arc<C>, store: SessionStore, config: UploaderConfig) -> Self {
        Self {
            client,
            store,
            config,
            state: PipelineState::default(),
            current: None,
        }
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    /// Upload a queue of files in order.
    ///
    /// A saved session record whose path matches a queued file moves that
    /// file to the head of the queue, maximizing the chance the server-side
    /// session is still alive when we get to it. A record naming a file no
    /// longer queued is deleted.
    pub async fn upload_all(
        &mut self,
        mut jobs: Vec<FileJob>,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        if let Some(record) = self.store.load().await {
            match jobs.iter().position(|j| j.path_string() == record.file_path) {
                Some(pos) if pos > 0 => {
                    info!(
                        target: "uploader",
                        file = %record.file_path,
                        "moving file with saved session to the head of the queue"
                    );
                    let job = jobs.remove(pos);
                    jobs.insert(0, job);
                }
                Some(_) => {}
                None => {
                    info!(
                        target: "uploader",
                        file = %record.file_path,
                        "recorded file is not queued, deleting session record"
                    );
                    self.store.delete().await;
                }
            }
        }

        let mut reader = FileReader::new(self.config.read_buffer_size);
        for i in 0..jobs.len() {
            let next = jobs.get(i + 1).map(|j| j.source_path.clone());
            self.upload_file(&jobs[i], next.as_deref(), &mut reader, progress)
                .await?;
        }
        Ok(())
    }

    /// Upload one file, retrying whole-file failures.
    ///
    /// Every retry re-opens the file from the beginning; the resume protocol
    /// decides per chunk whether to skip, verify, or restart.
    pub async fn upload_file(
        &mut self,
        job: &FileJob,
        next: Option<&Path>,
        reader: &mut FileReader,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        info!(
            target: "uploader",
            local_path = %job.source_path.display(),
            remote_path = %job.remote_path,
            total_size = job.total_size,
            "starting upload"
        );
        progress.on_file_start(&job.remote_path, job.total_size);

        let mut attempt = 0u32;
        loop {
            match self.run_attempt(job, next, reader, progress).await {
                Ok(()) => {
                    info!(
                        target: "uploader",
                        remote_path = %job.remote_path,
                        "upload completed"
                    );
                    progress.on_file_done(&job.remote_path);
                    return Ok(());
                }
                Err(e) => {
                    self.state = PipelineState::default();
                    if attempt >= self.config.max_file_retries {
                        error!(
                            target: "uploader",
                            local_path = %job.source_path.display(),
                            error = %e,
                            "upload failed, retries exhausted"
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        target: "uploader",
                        local_path = %job.source_path.display(),
                        attempt,
                        error = %e,
                        "upload attempt failed, restarting file"
                    );
                }
            }
        }
    }

    async fn run_attempt(
        &mut self,
        job: &FileJob,
        next: Option<&Path>,
        reader: &mut FileReader,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        self.prepare(job).await?;

        reader.enqueue_next(&job.source_path);
        reader.open_next().await?;
        if let Some(next) = next {
            reader.enqueue_next(next);
        }

        let mut acc = ChunkAccumulator::new(self.config.chunk_size, self.config.arena_capacity);
        let mut tracker = ProgressTracker::new(job.total_size);

        match self.config.password.clone() {
            Some(password) => {
                self.stream_encrypted(job, reader, &mut acc, &mut tracker, progress, &password)
                    .await
            }
            None => self.stream_direct(reader, &mut acc, &mut tracker, progress).await,
        }
    }

    async fn stream_direct(
        &mut self,
        reader: &mut FileReader,
        acc: &mut ChunkAccumulator,
        tracker: &mut ProgressTracker,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        loop {
            let (block, len) = reader.read_block().await?;
            if len == 0 {
                break;
            }
            if acc.should_emit_before(len) {
                self.emit(acc, None, tracker, progress).await?;
            }
            acc.append(block);
        }

        let final_len = acc.len() as u64;
        let final_bytes = acc.take_remaining();
        self.finish(final_bytes).await?;
        progress.on_progress(tracker.advance(final_len));
        Ok(())
    }

    async fn stream_encrypted(
        &mut self,
        job: &FileJob,
        reader: &mut FileReader,
        acc: &mut ChunkAccumulator,
        tracker: &mut ProgressTracker,
        progress: &impl ProgressCallback,
        password: &str,
    ) -> UploadResult<()> {
        // Resume replays the recorded salt so the ciphertext is byte-identical
        let salt = match self.state.saved_salt {
            Some(salt) => salt,
            None => SaltSource::Random.take(SALT_LEN)?,
        };
        let mut salt_source = SaltSource::fixed(salt);

        let basename = job
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| UploadError::Encryption("source path has no file name".to_string()))?;

        let (mut writer, opening) =
            ArchiveWriter::begin(&basename, password, &mut salt_source, &job.client_modified)?;
        self.feed_plain(acc, &opening, &salt, tracker, progress).await?;

        loop {
            let (block, len) = reader.read_block().await?;
            if len == 0 {
                break;
            }
            for piece in block.chunks(CIPHER_SLICE) {
                if acc.should_emit_before(piece.len()) {
                    self.emit(acc, Some(&salt), tracker, progress).await?;
                }
                let region = acc.append(piece);
                writer.encrypt_in_place(region);
            }
        }

        let trailer = writer.finish();
        self.feed_plain(acc, &trailer, &salt, tracker, progress).await?;

        let final_len = acc.len() as u64;
        let final_bytes = acc.take_remaining();
        self.finish(final_bytes).await?;
        progress.on_progress(tracker.advance(final_len));
        Ok(())
    }

    /// Append unencrypted framing bytes (archive header/trailer) to the arena
    async fn feed_plain(
        &mut self,
        acc: &mut ChunkAccumulator,
        data: &[u8],
        salt: &[u8; SALT_LEN],
        tracker: &mut ProgressTracker,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        if acc.should_emit_before(data.len()) {
            self.emit(acc, Some(salt), tracker, progress).await?;
        }
        acc.append(data);
        Ok(())
    }

    /// Hand the filled arena to the driver as one chunk and reclaim it
    async fn emit(
        &mut self,
        acc: &mut ChunkAccumulator,
        salt: Option<&[u8; SALT_LEN]>,
        tracker: &mut ProgressTracker,
        progress: &impl ProgressCallback,
    ) -> UploadResult<()> {
        let len = acc.len() as u64;
        self.upload_chunk(acc.filled(), salt).await?;
        acc.clear();
        progress.on_progress(tracker.advance(len));
        Ok(())
    }

    /// Clear transient state and load any saved session for this file.
    ///
    /// A record matching the job arms the resume path; a mismatching record
    /// is deleted and the upload proceeds fresh. Idempotent.
    pub async fn prepare(&mut self, job: &FileJob) -> UploadResult<()> {
        self.state = PipelineState::default();
        self.current = Some(job.clone());

        if let Some(record) = self.store.load().await {
            let mode_matches = record.encryption_salt.is_some() == self.config.password.is_some();
            let valid = mode_matches
                && record.matches(&job.path_string(), job.total_size, &job.client_modified);

            if valid {
                let salt = match (&record.encryption_salt, record.salt_bytes()) {
                    (Some(_), None) => {
                        // stored salt does not decode to 16 bytes
                        warn!(target: "uploader", "session record carries a malformed salt, deleting");
                        self.store.delete().await;
                        self.state.status = DriverState::Prepared;
                        return Ok(());
                    }
                    (_, salt) => salt,
                };

                info!(
                    target: "uploader",
                    session_id = %record.session_id,
                    resume_offset = record.current_offset,
                    "resuming saved upload session"
                );
                self.state.resume_offset = record.current_offset;
                self.state.upload_offset = record.current_offset;
                self.state.active_session = Some(record.session_id.clone());
                self.state.saved_hash = Some(record.content_hash.clone());
                self.state.saved_salt = salt;
            } else {
                info!(
                    target: "uploader",
                    recorded = %record.file_path,
                    "session record does not match the file, deleting"
                );
                self.store.delete().await;
            }
        }

        self.state.status = DriverState::Prepared;
        Ok(())
    }

    /// Process one chunk from the accumulator.
    ///
    /// The chunk is folded into the hash chain, verified against the record
    /// at the resume point, skipped when the server already holds it, and
    /// otherwise dispatched with the per-call content hash. Progress is
    /// persisted after every successful dispatch.
    pub async fn upload_chunk(
        &mut self,
        chunk: &[u8],
        salt: Option<&[u8; SALT_LEN]>,
    ) -> UploadResult<()> {
        if self.state.status == DriverState::Idle {
            return Err(UploadError::InvalidState(
                "upload_chunk called before prepare".to_string(),
            ));
        }

        let len = chunk.len() as u64;
        self.state.hash_state = chain_hash(&self.state.hash_state, chunk);
        self.state.local_offset += len;

        if self.state.resume_offset > 0 && !self.state.hash_verified {
            self.state.status = DriverState::ChunkingBeforeResume;
            if self.state.local_offset >= self.state.resume_offset {
                let computed = hex::encode(self.state.hash_state);
                let saved = self.state.saved_hash.clone().unwrap_or_default();
                if !computed.eq_ignore_ascii_case(&saved) {
                    warn!(
                        target: "uploader",
                        local_offset = self.state.local_offset,
                        resume_offset = self.state.resume_offset,
                        "chain hash does not match the session record"
                    );
                    return self.fail_resume("hash verification failed").await;
                }
                debug!(target: "uploader", offset = self.state.local_offset, "resume point verified");
                self.state.hash_verified = true;
                self.state.status = DriverState::Verified;
            }
        }

        // The server already holds everything up to the resume offset
        if self.state.local_offset <= self.state.resume_offset {
            debug!(
                target: "uploader",
                local_offset = self.state.local_offset,
                "skipping chunk below resume offset"
            );
            return Ok(());
        }

        self.state.status = DriverState::Uploading;
        let hash = content_hash(chunk);
        let data = Bytes::copy_from_slice(chunk);

        match self.state.active_session.clone() {
            None => {
                let client = Arc::clone(&self.client);
                let session_id = self
                    .with_retry(|| {
                        let client = Arc::clone(&client);
                        let data = data.clone();
                        let hash = hash.clone();
                        async move { client.upload_session_start(data, Some(hash)).await }
                    })
                    .await?;
                debug!(target: "uploader", session_id = %session_id, "upload session started");
                self.state.active_session = Some(session_id);
            }
            Some(session_id) => {
                let client = Arc::clone(&self.client);
                let offset = self.state.upload_offset;
                let result = self
                    .with_retry(|| {
                        let client = Arc::clone(&client);
                        let session_id = session_id.clone();
                        let data = data.clone();
                        let hash = hash.clone();
                        async move {
                            client
                                .upload_session_append(&session_id, offset, data, Some(hash))
                                .await
                        }
                    })
                    .await;

                if let Err(e) = result {
                    if is_session_lost(&e) {
                        warn!(target: "uploader", session_id = %session_id, "server no longer knows the session");
                        return self.fail_resume("session not found").await;
                    }
                    return Err(e);
                }
            }
        }

        self.state.upload_offset += len;
        self.persist_progress(salt).await;
        Ok(())
    }

    /// Finalize the upload with the remaining bytes.
    ///
    /// When no session was ever opened the whole payload goes through the
    /// single-shot route. The session record is deleted only on success;
    /// a failure leaves it for the next attempt.
    pub async fn finish(&mut self, final_bytes: Vec<u8>) -> UploadResult<()> {
        let job = self
            .current
            .clone()
            .ok_or_else(|| UploadError::InvalidState("finish called before prepare".to_string()))?;

        // The replayed stream ended before reaching the recorded offset;
        // the source must have changed despite matching size and mtime
        if self.state.resume_offset > 0 && !self.state.hash_verified {
            return self
                .fail_resume("stream ended before the recorded resume offset")
                .await;
        }

        let len = final_bytes.len() as u64;
        let hash = content_hash(&final_bytes);
        let data = Bytes::from(final_bytes);
        let commit = CommitInfo::new(job.remote_path.clone(), &job.client_modified);

        match self.state.active_session.clone() {
            None => {
                let client = Arc::clone(&self.client);
                self.with_retry(|| {
                    let client = Arc::clone(&client);
                    let commit = commit.clone();
                    let data = data.clone();
                    let hash = hash.clone();
                    async move { client.upload(commit, data, Some(hash)).await }
                })
                .await?;
            }
            Some(session_id) => {
                let client = Arc::clone(&self.client);
                let offset = self.state.upload_offset;
                let result = self
                    .with_retry(|| {
                        let client = Arc::clone(&client);
                        let session_id = session_id.clone();
                        let commit = commit.clone();
                        let data = data.clone();
                        let hash = hash.clone();
                        async move {
                            client
                                .upload_session_finish(&session_id, offset, commit, data, Some(hash))
                                .await
                        }
                    })
                    .await;

                if let Err(e) = result {
                    if is_session_lost(&e) {
                        warn!(target: "uploader", session_id = %session_id, "session vanished at finish");
                        return self.fail_resume("session not found").await;
                    }
                    return Err(e);
                }
            }
        }

        self.state.upload_offset += len;
        self.store.delete().await;
        self.state = PipelineState::default();
        Ok(())
    }

    /// Save the resume record for the progress made so far
    async fn persist_progress(&mut self, salt: Option<&[u8; SALT_LEN]>) {
        let Some(job) = &self.current else { return };
        let Some(session_id) = &self.state.active_session else { return };

        let encryption_salt = salt
            .map(|s| hex::encode(s))
            .or_else(|| self.state.saved_salt.map(hex::encode));

        let record = SessionRecord {
            session_id: session_id.clone(),
            file_path: job.path_string(),
            client_modified: job.client_modified,
            total_size: job.total_size,
            current_offset: self.state.local_offset,
            encryption_salt,
            content_hash: hex::encode(self.state.hash_state),
        };
        self.store.save(&record).await;
    }

    /// Delete the record, clear state, and surface a resume failure
    async fn fail_resume<T>(&mut self, message: &str) -> UploadResult<T> {
        self.store.delete().await;
        self.state = PipelineState::default();
        Err(UploadError::resume_failed(message))
    }

    /// Retry one cloud call over the transient classes.
    ///
    /// Timeouts retry immediately; connection and name-resolution failures
    /// back off linearly. Each invocation of the closure presents a fresh
    /// request over the same stable bytes.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> UploadResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max = self.config.max_call_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max => {
                    warn!(
                        target: "uploader",
                        attempt,
                        error = %e,
                        "transient failure, retrying"
                    );
                    if e.is_transient_connect() {
                        tokio::time::sleep(self.config.retry_delay_unit * attempt).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(UploadError::RetriesExhausted {
                        attempts: max,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_session_lost(e: &UploadError) -> bool {
    matches!(e, UploadError::Cloud(api) if api.is_session_not_found())
}
