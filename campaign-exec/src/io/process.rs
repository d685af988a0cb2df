//! Helpers for running child processes under a [`RunContext`] with bounded output.

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

use crate::io::context::RunContext;

/// Default cap on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10 * 1024 * 1024;
/// Output limit for commands whose stdout is data (diffs, status), not logs.
pub const UNLIMITED_OUTPUT: usize = usize::MAX;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout as data: fails instead of returning a cut-off prefix.
    pub fn into_complete_stdout(self, label: &str) -> Result<Vec<u8>> {
        if self.stdout_truncated > 0 {
            return Err(anyhow!(
                "{label} output exceeded the capture limit by {} bytes",
                self.stdout_truncated
            ));
        }
        Ok(self.stdout)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Render a command as a single shell-like line for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Run a command until it exits or `ctx` is done, capturing stdout/stderr
/// without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes`
/// bounds what is kept in memory; the rest is drained and counted. When the
/// context expires the child is killed and the returned error downcasts to
/// [`Interrupted`](crate::error::Interrupted).
#[instrument(skip_all, fields(output_limit_bytes = output_limit_bytes))]
pub async fn run_command(
    ctx: &RunContext,
    mut cmd: Command,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let collect = async {
        tokio::try_join!(
            async { child.wait().await.context("wait for command") },
            read_stream_limited(stdout, output_limit_bytes),
            read_stream_limited(stderr, output_limit_bytes),
        )
    };

    let (status, (stdout, stdout_truncated), (stderr, stderr_truncated)) =
        match ctx.run(collect).await {
            Ok(result) => result?,
            Err(interrupted) => {
                warn!(reason = %interrupted, "command interrupted, killing");
                // The wait future is gone; kill explicitly so the child does
                // not linger until the handle drops.
                if let Err(e) = child.start_kill() {
                    debug!(err = %e, "kill after interrupt failed");
                }
                return Err(anyhow::Error::new(interrupted));
            }
        };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Like [`run_command`], but a non-zero exit becomes an error carrying stderr.
pub async fn run_checked(
    ctx: &RunContext,
    cmd: Command,
    label: &str,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let output = run_command(ctx, cmd, output_limit_bytes)
        .await
        .with_context(|| format!("run {label}"))?;
    if !output.success() {
        return Err(anyhow!(
            "{label} failed with status {:?}: {}",
            output.status.code(),
            output.stderr_lossy().trim()
        ));
    }
    Ok(output)
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
