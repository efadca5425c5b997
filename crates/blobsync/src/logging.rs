use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "blobsync=info,blobsync_core=info,blobsync_bucket=info";

/// Send every record to `log_file` (appending) and to stderr. The returned
/// guard flushes the file writer when dropped, so hold it for the whole run.
pub fn init_logging(log_file: &Path, json: bool) -> Result<WorkerGuard> {
    let directory = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)
        .with_context(|| format!("failed to create log directory {}", directory.display()))?;
    let file_name = log_file
        .file_name()
        .with_context(|| format!("log file path {} has no file name", log_file.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    let installed = if json {
        tracing_subscriber::registry()
            .with(file_layer.json().with_filter(env_filter()))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_filter(env_filter()),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(file_layer.with_filter(env_filter()))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter()),
            )
            .try_init()
    };
    installed.context("failed to install tracing subscriber")?;

    Ok(guard)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
