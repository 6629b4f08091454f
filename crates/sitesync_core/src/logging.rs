use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub fn daily_log_path(logs_dir: &Path, date: NaiveDate) -> PathBuf {
    logs_dir.join(format!("{}.log", date.format("%Y-%m-%d")))
}

/// Install the global subscriber: stderr, plus an append-only file for today
/// when `logs_dir` is given.
///
/// `RUST_LOG` wins over `verbose`. When the log file cannot be opened the run
/// still gets stderr logging and `Ok(None)` is returned.
pub fn init_logging(logs_dir: Option<&Path>, verbose: bool) -> Result<Option<PathBuf>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let log_file = logs_dir.map(|dir| {
        let path = daily_log_path(dir, Local::now().date_naive());
        open_log_file(&path).map(|file| (path, file))
    });
    match log_file {
        Some(Ok((path, file))) => {
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .map_err(|error| anyhow!("failed to install log subscriber: {error}"))?;
            Ok(Some(path))
        }
        other => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .map_err(|error| anyhow!("failed to install log subscriber: {error}"))?;
            if let Some(Err(error)) = other {
                tracing::warn!(error = %format!("{error:#}"), "file logging disabled");
            }
            Ok(None)
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}
