mod config;
mod logging;
mod sync;
mod uploader;

use anyhow::{Context, Result};
use config::{Config, usage};
use dropbox_api::Client;
use logging::LogOptions;
use std::process::ExitCode;
use std::sync::Arc;
use uploader::{ConsoleProgress, SessionStore, Uploader, UploaderConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "dropbox-encrypted-uploader".to_string());

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{}", usage(&program));
            return ExitCode::from(2);
        }
    };

    let _log_guard = match logging::init(LogOptions::default()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            // Sync still works without file logs; say so and carry on
            eprintln!("warning: file logging disabled: {e:#}");
            None
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(target: "main", error = %format!("{e:#}"), "sync failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        target: "main",
        local = %config.local_path.display(),
        remote = %config.remote_path,
        encrypted = config.encrypt(),
        "starting sync"
    );

    let client = Arc::new(Client::new(config.token.clone()).context("failed to build API client")?);

    let store = SessionStore::open(&config.local_path);
    store.sweep_expired().await;

    let uploader_config = UploaderConfig {
        password: config.password.clone(),
        ..UploaderConfig::default()
    };
    let mut uploader = Uploader::new(Arc::clone(&client), store, uploader_config);

    let progress = ConsoleProgress::new();
    sync::run_sync(
        client.as_ref(),
        &mut uploader,
        &config.local_path,
        &config.remote_path,
        config.encrypt(),
        &progress,
    )
    .await?;

    tracing::info!(target: "main", "sync complete");
    Ok(())
}
