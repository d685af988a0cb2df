use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use crate::core::types::{Repository, StepChanges};
use crate::io::context::RunContext;
use crate::io::docker::bind_mount;
use crate::io::git::Git;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_checked};

/// Workspace backed by a host temp directory.
///
/// The directory is removed when this value drops, so an early return during
/// creation cleans up on its own.
#[derive(Debug)]
pub struct BindWorkspace {
    dir: TempDir,
    git: Git,
}

impl BindWorkspace {
    pub async fn create(
        ctx: &RunContext,
        temp_root: Option<&Path>,
        repo: &Repository,
        archive: &Path,
    ) -> Result<Self> {
        let prefix = format!("workspace-{}-", repo.slug());
        let dir = match temp_root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .with_context(|| format!("create {}", root.display()))?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix(&prefix).tempdir(),
        }
        .context("create workspace directory")?;

        let mut tar = Command::new("tar");
        tar.arg("-xf").arg(archive).arg("-C").arg(dir.path());
        run_checked(ctx, tar, "tar -xf", DEFAULT_OUTPUT_LIMIT_BYTES)
            .await
            .with_context(|| format!("unpack {}", archive.display()))?;

        let git = Git::new(dir.path());
        git.init_baseline(ctx).await?;
        debug!(path = %dir.path().display(), "bind workspace created");
        Ok(Self { dir, git })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn docker_run_opts(&self, target: &str) -> Vec<String> {
        bind_mount(self.path(), target, false)
    }

    pub async fn changes(&self, ctx: &RunContext) -> Result<StepChanges> {
        self.git.changes(ctx).await
    }

    pub async fn diff(&self, ctx: &RunContext) -> Result<Vec<u8>> {
        self.git.diff_cached(ctx).await
    }

    pub async fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .context("join workspace removal")?
            .with_context(|| format!("remove workspace {}", path.display()))?;
        debug!(path = %path.display(), "bind workspace removed");
        Ok(())
    }
}
