//! Repository snapshot retrieval.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::core::types::Repository;
use crate::io::context::RunContext;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command};

/// Produces a tar archive of a repository at its resolved revision.
///
/// Implementations must be idempotent and must not leave partial archives
/// behind when `ctx` expires mid-fetch.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, ctx: &RunContext, repo: &Repository) -> Result<PathBuf>;
}

/// Archives local clones found under `repos_dir/<repository name>`.
#[derive(Debug, Clone)]
pub struct GitArchiveFetcher {
    repos_dir: PathBuf,
    archive_dir: PathBuf,
}

impl GitArchiveFetcher {
    pub fn new(repos_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn clone_path(&self, repo: &Repository) -> PathBuf {
        self.repos_dir.join(&repo.name)
    }

    pub fn archive_path(&self, repo: &Repository) -> PathBuf {
        let rev = if repo.rev().is_empty() {
            "HEAD"
        } else {
            repo.rev()
        };
        self.archive_dir
            .join(format!("{}-{}.tar", repo.slug(), rev))
    }
}

#[async_trait]
impl RepoFetcher for GitArchiveFetcher {
    #[instrument(skip_all, fields(repo = %repo.name))]
    async fn fetch(&self, ctx: &RunContext, repo: &Repository) -> Result<PathBuf> {
        let dest = self.archive_path(repo);
        if tokio::fs::try_exists(&dest)
            .await
            .with_context(|| format!("stat {}", dest.display()))?
        {
            debug!(path = %dest.display(), "reusing archive");
            return Ok(dest);
        }

        let clone = self.clone_path(repo);
        if !is_dir(&clone).await {
            return Err(anyhow!(
                "no local clone of {} at {}",
                repo.name,
                clone.display()
            ));
        }

        tokio::fs::create_dir_all(&self.archive_dir)
            .await
            .with_context(|| format!("create {}", self.archive_dir.display()))?;
        // Dropped (and deleted) on every early return, including interruption.
        let tmp = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".tar")
            .tempfile_in(&self.archive_dir)
            .with_context(|| format!("create temp archive in {}", self.archive_dir.display()))?
            .into_temp_path();

        let rev = if repo.rev().is_empty() {
            "HEAD"
        } else {
            repo.rev()
        };
        let mut cmd = Command::new("git");
        cmd.arg("archive")
            .arg("--format=tar")
            .arg("--output")
            .arg(&*tmp)
            .arg(rev)
            .current_dir(&clone);
        let output = run_command(ctx, cmd, DEFAULT_OUTPUT_LIMIT_BYTES)
            .await
            .with_context(|| format!("git archive {}", repo.name))?;
        if !output.success() {
            return Err(anyhow!(
                "git archive {} at {rev} failed: {}",
                repo.name,
                output.stderr_lossy().trim()
            ));
        }

        tmp.persist(&dest)
            .with_context(|| format!("move archive to {}", dest.display()))?;
        info!(path = %dest.display(), rev, "fetched repository archive");
        Ok(dest)
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}
