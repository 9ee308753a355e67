//! Double-buffered asynchronous file reader.
//!
//! Two read arenas alternate: while the downstream consumes one block, the
//! next read is already in flight into the other arena. Near end-of-file the
//! reader launches a background task that opens and primes the next queued
//! file, so the upload of one file overlaps the open of the following one.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default read arena size
pub const DEFAULT_READ_BUFFER_SIZE: usize = 90 * 1024 * 1024;

/// A completed read: the file handle, the arena it filled, and the fill level
struct ReadResult {
    file: File,
    buf: Vec<u8>,
    len: usize,
}

enum Inflight {
    Task(JoinHandle<io::Result<ReadResult>>),
    Ready(ReadResult),
}

pub struct FileReader {
    buf_size: usize,
    /// Block most recently handed downstream
    current: Option<Vec<u8>>,
    current_len: usize,
    inflight: Option<Inflight>,
    /// Arenas not currently holding data or feeding an in-flight read
    free: Vec<Vec<u8>>,
    next_hint: Option<PathBuf>,
    preopen: Option<(PathBuf, JoinHandle<io::Result<ReadResult>>)>,
}

impl FileReader {
    pub fn new(buf_size: usize) -> Self {
        Self {
            buf_size,
            current: None,
            current_len: 0,
            inflight: None,
            free: vec![vec![0u8; buf_size], vec![0u8; buf_size]],
            next_hint: None,
            preopen: None,
        }
    }

    /// Set the next-file hint; idempotent until consumed by `open_next`
    pub fn enqueue_next(&mut self, path: &Path) {
        self.next_hint = Some(path.to_path_buf());
    }

    /// Close any prior file and open the queued one, using the pre-opened
    /// handle when the EOF transition managed to prime it. Pre-open failures
    /// are deferred to this call so they attribute to the right file.
    pub async fn open_next(&mut self) -> io::Result<()> {
        // Drop any stale in-flight read from a previous file
        if let Some(Inflight::Task(task)) = self.inflight.take() {
            task.abort();
        }

        if let Some((path, task)) = self.preopen.take() {
            // A retry may have re-pointed the hint at a different file;
            // the stale pre-open is discarded, not consumed
            if self.next_hint.as_deref() == Some(path.as_path()) {
                let result = task.await.map_err(io::Error::other)??;
                debug!(target: "uploader::reader", len = result.len, "using pre-opened file");
                self.next_hint = None;
                self.inflight = Some(Inflight::Ready(result));
                return Ok(());
            }
            task.abort();
        }

        let path = self.next_hint.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no file queued for open_next")
        })?;

        let buf = self.take_arena();
        let result = open_and_prime(&path, buf).await?;
        debug!(target: "uploader::reader", path = %path.display(), len = result.len, "opened file");
        self.inflight = Some(Inflight::Ready(result));
        Ok(())
    }

    /// Return the next filled block; a zero length signals end-of-file.
    ///
    /// On the EOF transition, a queued next file is opened and primed in a
    /// background task that `open_next` will await.
    pub async fn read_block(&mut self) -> io::Result<(&[u8], usize)> {
        let result = match self.inflight.take() {
            Some(Inflight::Ready(result)) => result,
            Some(Inflight::Task(task)) => task.await.map_err(io::Error::other)??,
            None => return Ok((&[], 0)),
        };

        if let Some(old) = self.current.take() {
            self.free.push(old);
        }
        self.current = Some(result.buf);
        self.current_len = result.len;

        if result.len > 0 {
            let mut buf = self.take_arena();
            let mut file = result.file;
            self.inflight = Some(Inflight::Task(tokio::spawn(async move {
                let len = file.read(&mut buf[..]).await?;
                Ok(ReadResult { file, buf, len })
            })));
        } else {
            trace!(target: "uploader::reader", "end of file");
            if self.preopen.is_none()
                && let Some(path) = self.next_hint.clone()
            {
                let buf = self.take_arena();
                let task_path = path.clone();
                self.preopen = Some((
                    path,
                    tokio::spawn(async move { open_and_prime(&task_path, buf).await }),
                ));
            }
        }

        let block = self.current.as_deref().unwrap_or(&[]);
        Ok((&block[..self.current_len], self.current_len))
    }

    /// The most recently returned block; stable until the next `read_block`
    pub fn current_block(&self) -> &[u8] {
        self.current
            .as_deref()
            .map(|b| &b[..self.current_len])
            .unwrap_or(&[])
    }

    fn take_arena(&mut self) -> Vec<u8> {
        self.free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }
}

async fn open_and_prime(path: &Path, mut buf: Vec<u8>) -> io::Result<ReadResult> {
    let mut file = File::open(path).await?;
    let len = file.read(&mut buf[..]).await?;
    Ok(ReadResult { file, buf, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    async fn drain(reader: &mut FileReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let (block, len) = reader.read_block().await.unwrap();
            if len == 0 {
                break;
            }
            out.extend_from_slice(block);
        }
        out
    }

    #[tokio::test]
    async fn reads_single_file_across_blocks() {
        let tmp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let path = write_file(&tmp, "a.bin", &data);

        let mut reader = FileReader::new(64);
        reader.enqueue_next(&path);
        reader.open_next().await.unwrap();
        assert_eq!(drain(&mut reader).await, data);
    }

    #[tokio::test]
    async fn preopens_next_file_at_eof() {
        let tmp = TempDir::new().unwrap();
        let first = write_file(&tmp, "a.bin", &[1u8; 200]);
        let second = write_file(&tmp, "b.bin", &[2u8; 300]);

        let mut reader = FileReader::new(128);
        reader.enqueue_next(&first);
        reader.open_next().await.unwrap();

        reader.enqueue_next(&second);
        assert_eq!(drain(&mut reader).await, vec![1u8; 200]);

        // EOF scheduled the pre-open; open_next consumes it
        reader.open_next().await.unwrap();
        assert_eq!(drain(&mut reader).await, vec![2u8; 300]);
    }

    #[tokio::test]
    async fn preopen_failure_surfaces_on_open_next() {
        let tmp = TempDir::new().unwrap();
        let first = write_file(&tmp, "a.bin", &[1u8; 50]);

        let mut reader = FileReader::new(64);
        reader.enqueue_next(&first);
        reader.open_next().await.unwrap();

        reader.enqueue_next(&tmp.path().join("missing.bin"));
        drain(&mut reader).await;

        // the error belongs to the missing file, not the completed one
        assert!(reader.open_next().await.is_err());
    }

    #[tokio::test]
    async fn empty_file_yields_immediate_eof() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "empty.bin", &[]);

        let mut reader = FileReader::new(64);
        reader.enqueue_next(&path);
        reader.open_next().await.unwrap();
        let (_, len) = reader.read_block().await.unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn open_next_without_hint_is_an_error() {
        let mut reader = FileReader::new(64);
        assert!(reader.open_next().await.is_err());
    }
}
