//! Logging: a rotating JSON file for diagnostics plus a quiet console.
//!
//! The two outputs are filtered independently. The file keeps the pipeline
//! targets at debug so an interrupted upload can be diagnosed after the fact
//! from the log alone; the console defaults to info and follows `RUST_LOG`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, Layer, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub struct LogOptions {
    /// Directory for the rotating file log
    pub directory: PathBuf,
    /// File name prefix, completed by the rotation date and `.log`
    pub prefix: String,
    /// Rotated files kept before the oldest is removed
    pub keep_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        let directory = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("DropboxEncryptedUploader")
            .join("logs");

        Self {
            directory,
            prefix: "uploader".to_string(),
            keep_files: 5,
        }
    }
}

/// Per-target levels for the file log.
///
/// Resume decisions, session-record writes, and chunk skips all log at debug
/// under these targets; they are exactly what a post-mortem of a failed
/// resume needs. The chattier `api` target stays at info.
fn file_targets() -> Targets {
    Targets::new()
        .with_default(LevelFilter::INFO)
        .with_target("uploader", LevelFilter::DEBUG)
        .with_target("uploader::reader", LevelFilter::DEBUG)
        .with_target("uploader::archive", LevelFilter::DEBUG)
        .with_target("uploader::session", LevelFilter::DEBUG)
        .with_target("sync", LevelFilter::DEBUG)
        .with_target("sync::recycler", LevelFilter::DEBUG)
        .with_target("api", LevelFilter::INFO)
}

/// Install the global subscriber. The returned guard owns the non-blocking
/// writer thread and must live until the process exits.
pub fn init(options: LogOptions) -> Result<LogGuard> {
    std::fs::create_dir_all(&options.directory).with_context(|| {
        format!(
            "failed to create log directory {}",
            options.directory.display()
        )
    })?;

    let rolling = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&options.prefix)
        .filename_suffix("log")
        .max_log_files(options.keep_files)
        .build(&options.directory)
        .context("failed to create rolling file appender")?;
    let (file_writer, guard) = tracing_appender::non_blocking(rolling);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_current_span(false)
        .with_filter(file_targets());

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer()
        .compact()
        .without_time()
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::info!(
        target: "main",
        directory = %options.directory.display(),
        keep_files = options.keep_files,
        "logging ready"
    );

    Ok(LogGuard { _writer: guard })
}

/// Holds the background writer; dropping it flushes buffered file output
pub struct LogGuard {
    _writer: tracing_appender::non_blocking::WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn default_options_point_at_the_app_data_dir() {
        let options = LogOptions::default();
        assert_eq!(options.prefix, "uploader");
        assert_eq!(options.keep_files, 5);
        assert!(
            options
                .directory
                .to_string_lossy()
                .contains("DropboxEncryptedUploader")
        );
    }

    #[test]
    fn file_log_keeps_pipeline_targets_at_debug() {
        let targets = file_targets();
        assert!(targets.would_enable("uploader::session", &Level::DEBUG));
        assert!(targets.would_enable("sync::recycler", &Level::DEBUG));
        assert!(!targets.would_enable("api", &Level::DEBUG));
        assert!(targets.would_enable("api", &Level::INFO));
        // unknown targets fall back to the info default
        assert!(!targets.would_enable("hyper", &Level::DEBUG));
    }
}
