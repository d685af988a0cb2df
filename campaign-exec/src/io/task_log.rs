//! Per-task log files.
//!
//! Tracing output is for developers and depends on `RUST_LOG`; these files are
//! the product record of what each task executed. One file per executed task,
//! named `<slug>-<timestamp>.log`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::types::Repository;

/// Creates and retires task logs under one directory.
#[derive(Debug, Clone)]
pub struct LogManager {
    dir: PathBuf,
    keep_logs: bool,
}

impl LogManager {
    pub fn new(dir: impl Into<PathBuf>, keep_logs: bool) -> Self {
        Self {
            dir: dir.into(),
            keep_logs,
        }
    }

    pub async fn create(&self, repo: &Repository) -> Result<TaskLog> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create log dir {}", self.dir.display()))?;

        let stem = format!("{}-{}", repo.slug(), Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.log")
            } else {
                format!("{stem}-{attempt}.log")
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(path = %path.display(), "opened task log");
                    return Ok(TaskLog {
                        path,
                        file: Mutex::new(file),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("create log {}", path.display()));
                }
            }
        }
    }

    /// Close `log`. Returns the path when the file is kept: always after a
    /// failure, after a success only with `keep_logs`.
    pub async fn finish(&self, log: TaskLog, success: bool) -> Option<PathBuf> {
        let TaskLog { path, file } = log;
        let mut file = file.into_inner();
        if let Err(err) = file.flush().await {
            warn!(path = %path.display(), err = %err, "failed to flush task log");
        }
        drop(file);

        if success && !self.keep_logs {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), err = %err, "failed to remove task log");
            }
            return None;
        }
        Some(path)
    }
}

/// Append-only log for one task. Write failures are warnings, never errors.
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TaskLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, text: &str) {
        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(text.as_bytes()).await {
            warn!(path = %self.path.display(), err = %err, "failed to write task log");
        }
    }

    pub async fn line(&self, text: &str) {
        self.write(&format!("{text}\n")).await;
    }

    /// A titled block, e.g. a step's stdout.
    pub async fn section(&self, title: &str, body: &str) {
        let mut buf = format!("=== {title} ===\n{body}");
        if !body.ends_with('\n') {
            buf.push('\n');
        }
        self.write(&buf).await;
    }
}
