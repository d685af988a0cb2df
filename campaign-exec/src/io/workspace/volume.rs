use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::porcelain::parse_git_status;
use crate::core::types::StepChanges;
use crate::io::context::RunContext;
use crate::io::docker::{Docker, bind_mount, volume_mount};
use crate::io::git::{STATUS_ARGS, init_script};

/// Where the volume is mounted inside helper containers.
const VOLUME_TARGET: &str = "/work";
/// Where the repository archive is mounted while unpacking.
const ARCHIVE_TARGET: &str = "/tmp/campaign-exec-archive.tar";
/// Deadline for removing a volume whose initialization failed.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Git in helper containers runs as root against files that may be owned by
/// the step user, so ownership checks are disabled per invocation.
const GIT: &str = "git -c safe.directory='*'";

/// Workspace backed by a container volume. Git runs in short-lived helper
/// containers, never on the host.
#[derive(Debug)]
pub struct VolumeWorkspace {
    docker: Arc<Docker>,
    volume: String,
    image: String,
}

impl VolumeWorkspace {
    pub async fn create(
        ctx: &RunContext,
        docker: Arc<Docker>,
        image: &str,
        owner_uid: Option<u32>,
        archive: &Path,
    ) -> Result<Self> {
        docker.ensure_image(ctx, image).await?;
        let volume = docker.volume_create(ctx).await?;
        let workspace = Self {
            docker,
            volume,
            image: image.to_string(),
        };

        let mut mounts = bind_mount(archive, ARCHIVE_TARGET, true);
        mounts.extend(workspace.docker_run_opts(VOLUME_TARGET));
        let script = unpack_script(owner_uid);
        if let Err(err) = workspace
            .run_script(ctx, mounts, &script)
            .await
            .with_context(|| format!("unpack {} into volume", archive.display()))
        {
            let cleanup = RunContext::detached(CLEANUP_TIMEOUT);
            if let Err(close_err) = workspace.close(&cleanup).await {
                warn!(err = %format!("{close_err:#}"), "failed to remove volume after error");
            }
            return Err(err);
        }
        debug!(volume = %workspace.volume, "volume workspace created");
        Ok(workspace)
    }

    pub fn docker_run_opts(&self, target: &str) -> Vec<String> {
        volume_mount(&self.volume, target)
    }

    pub async fn changes(&self, ctx: &RunContext) -> Result<StepChanges> {
        let script = format!(
            "set -e\n{GIT} add --all >/dev/null\nexec {GIT} {}\n",
            STATUS_ARGS.join(" ")
        );
        let out = self
            .run_script(ctx, self.docker_run_opts(VOLUME_TARGET), &script)
            .await
            .context("git status in volume")?;
        parse_git_status(&String::from_utf8_lossy(&out))
    }

    pub async fn diff(&self, ctx: &RunContext) -> Result<Vec<u8>> {
        let script = format!(
            "set -e\n{GIT} add --all >/dev/null\nexec {GIT} diff --cached --no-prefix --binary\n"
        );
        self.run_script(ctx, self.docker_run_opts(VOLUME_TARGET), &script)
            .await
            .context("git diff in volume")
    }

    pub async fn close(self, ctx: &RunContext) -> Result<()> {
        self.docker.volume_remove(ctx, &self.volume).await
    }

    /// Run `script` with `/bin/sh` in the helper image and return its stdout.
    async fn run_script(&self, ctx: &RunContext, mounts: Vec<String>, script: &str) -> Result<Vec<u8>> {
        let args = helper_args(mounts, &self.image, script);
        self.docker.run_checked_unlimited(ctx, &args).await
    }
}

fn helper_args(mounts: Vec<String>, image: &str, script: &str) -> Vec<String> {
    let mut args: Vec<String> = ["run", "--rm", "--init", "--workdir", VOLUME_TARGET]
        .into_iter()
        .map(str::to_string)
        .collect();
    args.extend(mounts);
    args.extend(
        ["--entrypoint", "/bin/sh", image, "-c", script]
            .into_iter()
            .map(str::to_string),
    );
    args
}

fn unpack_script(owner_uid: Option<u32>) -> String {
    let mut script = format!("set -e\ntar -xf {ARCHIVE_TARGET} -C {VOLUME_TARGET}\n");
    script.push_str(&init_script());
    if let Some(uid) = owner_uid {
        script.push_str(&format!("chown -R {uid} {VOLUME_TARGET}\n"));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRuntime;

    #[tokio::test]
    async fn diff_ignores_step_output_limit() {
        let patch = "+changed line\n".repeat(300);
        let runtime = FakeRuntime::new(&["/bin/sh"]).with_helper_output(patch.as_bytes());
        let docker = Arc::new(Docker::new(runtime.program()).with_output_limit(64));
        let ctx = RunContext::background();

        let workspace = VolumeWorkspace::create(
            &ctx,
            docker,
            "alpine/git:latest",
            None,
            Path::new("/tmp/repo.tar"),
        )
        .await
        .expect("create");
        let diff = workspace.diff(&ctx).await.expect("diff");
        assert_eq!(diff, patch.as_bytes());

        workspace.close(&ctx).await.expect("close");
        let calls = runtime.calls();
        assert!(calls.contains("volume create"));
        assert!(calls.contains("type=volume,source=fake-volume,target=/work"));
        assert!(calls.contains("volume rm fake-volume"));
    }

    #[test]
    fn unpack_script_unpacks_then_commits() {
        let script = unpack_script(None);
        let tar = script.find("tar -xf").expect("tar");
        let commit = script.find("git commit").expect("commit");
        assert!(script.starts_with("set -e\n"));
        assert!(tar < commit);
        assert!(!script.contains("chown"));
    }

    #[test]
    fn unpack_script_hands_files_to_owner() {
        let script = unpack_script(Some(1000));
        assert!(script.trim_end().ends_with("chown -R 1000 /work"));
    }

    #[test]
    fn helper_args_override_entrypoint() {
        let args = helper_args(volume_mount("vol", "/work"), "alpine/git:latest", "true");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--init",
                "--workdir",
                "/work",
                "--mount",
                "type=volume,source=vol,target=/work",
                "--entrypoint",
                "/bin/sh",
                "alpine/git:latest",
                "-c",
                "true",
            ]
        );
    }
}
