//! Container runtime adapter.
//!
//! The engine only needs a handful of CLI verbs, so it keeps a small explicit
//! wrapper around the `docker` (or compatible) binary instead of talking to
//! the daemon API.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::io::context::RunContext;
use crate::io::process::{
    CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, UNLIMITED_OUTPUT, run_checked, run_command,
};

/// Mount argument for a host path.
pub fn bind_mount(source: &Path, target: &str, read_only: bool) -> Vec<String> {
    let mut spec = format!("type=bind,source={},target={target}", source.display());
    if read_only {
        spec.push_str(",ro");
    }
    vec!["--mount".to_string(), spec]
}

/// Mount argument for a named volume.
pub fn volume_mount(volume: &str, target: &str) -> Vec<String> {
    vec![
        "--mount".to_string(),
        format!("type=volume,source={volume},target={target}"),
    ]
}

/// Wrapper for invoking the container runtime CLI.
#[derive(Debug)]
pub struct Docker {
    program: String,
    output_limit_bytes: usize,
    /// Images already confirmed present locally.
    ensured: Mutex<HashSet<String>>,
}

impl Docker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_output_limit(mut self, output_limit_bytes: usize) -> Self {
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args.iter().map(AsRef::as_ref));
        cmd
    }

    /// Run a CLI invocation and return its output regardless of exit status.
    pub async fn run<S: AsRef<str>>(&self, ctx: &RunContext, args: &[S]) -> Result<CommandOutput> {
        let cmd = self.command(args);
        run_command(ctx, cmd, self.output_limit_bytes)
            .await
            .with_context(|| format!("run {} {}", self.program, first_arg(args)))
    }

    /// Run a CLI invocation and fail on non-zero exit.
    pub async fn run_checked<S: AsRef<str>>(
        &self,
        ctx: &RunContext,
        args: &[S],
    ) -> Result<CommandOutput> {
        let label = format!("{} {}", self.program, first_arg(args));
        run_checked(ctx, self.command(args), &label, self.output_limit_bytes).await
    }

    /// Like [`Docker::run_checked`] but keeps all of stdout, for helper
    /// containers whose output is data rather than step logs.
    pub async fn run_checked_unlimited<S: AsRef<str>>(
        &self,
        ctx: &RunContext,
        args: &[S],
    ) -> Result<Vec<u8>> {
        let label = format!("{} {}", self.program, first_arg(args));
        run_checked(ctx, self.command(args), &label, UNLIMITED_OUTPUT)
            .await?
            .into_complete_stdout(&label)
    }

    /// Make sure `image` exists locally, pulling it on first use.
    #[instrument(skip_all, fields(image = %image))]
    pub async fn ensure_image(&self, ctx: &RunContext, image: &str) -> Result<()> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(image) {
            return Ok(());
        }
        let inspect = self
            .run(ctx, &["image", "inspect", "--format", "{{.Id}}", image])
            .await?;
        if !inspect.success() {
            info!(image, "image not present locally, pulling");
            self.run_checked(ctx, &["image", "pull", image])
                .await
                .with_context(|| format!("pull image {image}"))?;
        } else {
            debug!(image, id = %inspect.stdout_lossy().trim(), "image present");
        }
        ensured.insert(image.to_string());
        Ok(())
    }

    /// Create a volume and return its name.
    pub async fn volume_create(&self, ctx: &RunContext) -> Result<String> {
        let out = self.run_checked(ctx, &["volume", "create"]).await?;
        let name = out.stdout_lossy().trim().to_string();
        if name.is_empty() {
            return Err(anyhow!("{} volume create returned no name", self.program));
        }
        debug!(volume = %name, "created volume");
        Ok(name)
    }

    pub async fn volume_remove(&self, ctx: &RunContext, volume: &str) -> Result<()> {
        self.run_checked(ctx, &["volume", "rm", volume])
            .await
            .with_context(|| format!("remove volume {volume}"))?;
        debug!(volume, "removed volume");
        Ok(())
    }

    /// Force-remove a container. Best-effort: failures are only logged.
    pub async fn force_remove_container(&self, ctx: &RunContext, container_id: &str) {
        match self.run(ctx, &["rm", "-f", container_id]).await {
            Ok(out) if out.success() => debug!(container_id, "removed container"),
            Ok(out) => debug!(
                container_id,
                stderr = %out.stderr_lossy().trim(),
                "container already gone"
            ),
            Err(err) => warn!(container_id, err = %format!("{err:#}"), "failed to remove container"),
        }
    }

    /// User ID the image runs as by default.
    pub async fn image_uid(&self, ctx: &RunContext, image: &str) -> Result<u32> {
        let out = self
            .run_checked(
                ctx,
                &["run", "--rm", "--entrypoint", "/bin/sh", image, "-c", "id -u"],
            )
            .await
            .with_context(|| format!("probe user of image {image}"))?;
        parse_uid(&out.stdout_lossy()).with_context(|| format!("parse user of image {image}"))
    }
}

/// User ID of the current host process.
pub async fn host_uid(ctx: &RunContext) -> Result<u32> {
    let mut cmd = Command::new("id");
    cmd.arg("-u");
    let out = run_checked(ctx, cmd, "id -u", 1024).await?;
    parse_uid(&out.stdout_lossy())
}

fn parse_uid(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    trimmed
        .parse::<u32>()
        .map_err(|_| anyhow!("unexpected uid output '{trimmed}'"))
}

fn first_arg<S: AsRef<str>>(args: &[S]) -> &str {
    args.first().map(AsRef::as_ref).unwrap_or_default()
}
