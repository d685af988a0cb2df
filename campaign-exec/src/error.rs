//! Typed errors callers need to tell apart.
//!
//! Everything else propagates as `anyhow::Error` with context attached.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A step declared a pass-through variable that is not set on the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("environment variable {name} is not set")]
pub struct MissingEnvVarError {
    pub name: String,
}

/// A subprocess was stopped before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
}

/// Neither `/bin/bash` nor `/bin/sh` could run `mktemp` in the image.
#[derive(Debug, Clone, Error)]
#[error("probing image {image} for shell failed: {}", .attempts.join("; "))]
pub struct ShellProbeError {
    pub image: String,
    pub attempts: Vec<String>,
}

/// A step's container exited with a non-zero status.
#[derive(Debug, Clone, Error)]
#[error("{command} exited with status {}", exit_code_label(.exit_code))]
pub struct StepFailedError {
    /// Full container runtime command line.
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub run_script: String,
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown (killed by signal)".to_string(),
    }
}

impl StepFailedError {
    /// One-line cause suitable for top-level reporting.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.to_string())
    }

    /// Multi-line report with everything needed to reproduce the failure.
    pub fn details(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&format!("command: {}\n", self.command));
        buf.push_str(&format!("exit code: {}\n", exit_code_label(&self.exit_code)));
        buf.push_str("=== run script ===\n");
        buf.push_str(&self.run_script);
        buf.push_str("\n=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        buf
    }
}

/// Attached by the executor when a task ran past its configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution took longer than the configured timeout of {}", humanize(.timeout))]
pub struct TimeoutExceeded {
    pub timeout: Duration,
}

fn humanize(duration: &Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    if secs % 60 == 0 {
        return format!("{}m", secs / 60);
    }
    format!("{secs}s")
}

/// Fatal failure of one task, as returned by `Executor::wait`.
#[derive(Debug)]
pub struct TaskError {
    pub repo_name: String,
    /// Per-task log with full diagnostics, when one was written.
    pub log_file: Option<PathBuf>,
    cause: anyhow::Error,
}

impl TaskError {
    pub fn new(repo_name: impl Into<String>, log_file: Option<PathBuf>, cause: anyhow::Error) -> Self {
        Self {
            repo_name: repo_name.into(),
            log_file,
            cause,
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn is_timeout(&self) -> bool {
        self.cause.downcast_ref::<TimeoutExceeded>().is_some()
    }

    /// One-line cause: the first stderr line of a failed step, else the outermost message.
    pub fn summary(&self) -> String {
        if let Some(step) = self
            .cause
            .chain()
            .find_map(|err| err.downcast_ref::<StepFailedError>())
        {
            return step.summary();
        }
        self.cause
            .to_string()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.repo_name, self.summary())?;
        if let Some(path) = &self.log_file {
            write!(f, " (log: {})", path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}
