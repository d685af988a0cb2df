//! Git adapter for host-side workspaces.
//!
//! Workspaces need a deterministic baseline commit and staged diffs, so we keep
//! a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::core::porcelain::parse_git_status;
use crate::core::types::StepChanges;
use crate::io::context::RunContext;
use crate::io::process::{CommandOutput, UNLIMITED_OUTPUT, run_command};

/// Identity used for the baseline commit inside workspaces.
pub const WORKSPACE_USER_NAME: &str = "campaign-exec";
pub const WORKSPACE_USER_EMAIL: &str = "campaign-exec@localhost";
/// Message of the baseline commit every diff is computed against.
pub const BASELINE_COMMIT_MESSAGE: &str = "campaign-exec: baseline";
/// NUL-separated status, so paths are never C-quoted.
pub const STATUS_ARGS: [&str; 3] = ["status", "--porcelain", "-z"];

/// Shell snippet that turns an unpacked tree into a repository with a baseline
/// commit, for workspaces where git runs inside a container.
pub fn init_script() -> String {
    format!(
        "git init --quiet\n\
         git config --local user.name '{WORKSPACE_USER_NAME}'\n\
         git config --local user.email '{WORKSPACE_USER_EMAIL}'\n\
         git add --force --all\n\
         git commit --quiet --allow-empty -m '{BASELINE_COMMIT_MESSAGE}'\n"
    )
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Initialize a repository and commit everything as the baseline.
    ///
    /// Force-add so files matched by `.gitignore` are tracked too; steps may
    /// legitimately edit them.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub async fn init_baseline(&self, ctx: &RunContext) -> Result<()> {
        self.run_checked(ctx, &["init", "--quiet"]).await?;
        self.run_checked(ctx, &["config", "--local", "user.name", WORKSPACE_USER_NAME])
            .await?;
        self.run_checked(ctx, &["config", "--local", "user.email", WORKSPACE_USER_EMAIL])
            .await?;
        self.run_checked(ctx, &["add", "--force", "--all"]).await?;
        self.run_checked(
            ctx,
            &["commit", "--quiet", "--allow-empty", "-m", BASELINE_COMMIT_MESSAGE],
        )
        .await?;
        debug!("created baseline commit");
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub async fn add_all(&self, ctx: &RunContext) -> Result<()> {
        self.run_checked(ctx, &["add", "--all"]).await?;
        Ok(())
    }

    /// Stage everything and report what changed relative to the index baseline.
    pub async fn changes(&self, ctx: &RunContext) -> Result<StepChanges> {
        self.add_all(ctx).await?;
        let out = self.run_capture(ctx, &STATUS_ARGS).await?;
        parse_git_status(&out)
    }

    /// Staged diff without `a/`/`b/` prefixes, binary-safe.
    pub async fn diff_cached(&self, ctx: &RunContext) -> Result<Vec<u8>> {
        self.add_all(ctx).await?;
        let out = self
            .run_checked(ctx, &["diff", "--cached", "--no-prefix", "--binary"])
            .await?;
        out.into_complete_stdout("git diff")
    }

    async fn run_capture(&self, ctx: &RunContext, args: &[&str]) -> Result<String> {
        let output = self.run_checked(ctx, args).await?;
        let stdout = output.into_complete_stdout(&format!("git {}", args.join(" ")))?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn run_checked(&self, ctx: &RunContext, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(ctx, args).await?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    async fn run(&self, ctx: &RunContext, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command(ctx, cmd, UNLIMITED_OUTPUT)
            .await
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::DEFAULT_OUTPUT_LIMIT_BYTES;
    use std::fs;

    #[tokio::test]
    async fn baseline_then_changes_and_diff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("keep.txt"), "keep\n").expect("write");
        fs::write(root.join("edit.txt"), "before\n").expect("write");
        fs::write(root.join("gone.txt"), "gone\n").expect("write");
        fs::write(root.join(".gitignore"), "ignored.txt\n").expect("write");
        fs::write(root.join("ignored.txt"), "tracked anyway\n").expect("write");

        let ctx = RunContext::background();
        let git = Git::new(root);
        git.init_baseline(&ctx).await.expect("init");

        let clean = git.changes(&ctx).await.expect("changes");
        assert!(clean.is_empty());

        fs::write(root.join("edit.txt"), "after\n").expect("write");
        fs::write(root.join("new.txt"), "new\n").expect("write");
        fs::remove_file(root.join("gone.txt")).expect("remove");
        fs::write(root.join("ignored.txt"), "edited\n").expect("write");

        let changes = git.changes(&ctx).await.expect("changes");
        assert_eq!(changes.modified, vec!["edit.txt", "ignored.txt"]);
        assert_eq!(changes.added, vec!["new.txt"]);
        assert_eq!(changes.deleted, vec!["gone.txt"]);

        let diff = String::from_utf8(git.diff_cached(&ctx).await.expect("diff")).expect("utf8");
        assert!(diff.contains("diff --git edit.txt edit.txt"));
        assert!(diff.contains("+after"));
        assert!(!diff.contains("a/edit.txt"));
    }

    #[tokio::test]
    async fn changes_keep_unusual_paths_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("old name.txt"), "same\n").expect("write");

        let ctx = RunContext::background();
        let git = Git::new(root);
        git.init_baseline(&ctx).await.expect("init");

        fs::write(root.join("café.go"), "package main\n").expect("write");
        fs::rename(root.join("old name.txt"), root.join("new name.txt")).expect("rename");

        let changes = git.changes(&ctx).await.expect("changes");
        assert_eq!(changes.added, vec!["café.go"]);
        assert_eq!(changes.renamed, vec!["new name.txt"]);
    }

    #[tokio::test]
    async fn diff_larger_than_step_output_limit_is_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let ctx = RunContext::background();
        let git = Git::new(root);
        git.init_baseline(&ctx).await.expect("init");

        let line = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcde\n";
        let lines = DEFAULT_OUTPUT_LIMIT_BYTES / line.len() + 1024;
        fs::write(root.join("big.txt"), line.repeat(lines)).expect("write");

        let diff = git.diff_cached(&ctx).await.expect("diff");
        assert!(diff.len() > DEFAULT_OUTPUT_LIMIT_BYTES);
        assert!(diff.ends_with(b"\n"));
        let text = String::from_utf8(diff).expect("utf8");
        assert_eq!(text.matches("+0123456789abcdef").count(), lines);
    }

    #[test]
    fn init_script_force_adds_and_allows_empty() {
        let script = init_script();
        assert!(script.starts_with("git init --quiet\n"));
        assert!(script.contains("git add --force --all"));
        assert!(script.contains("--allow-empty"));
    }
}
