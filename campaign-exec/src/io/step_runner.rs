//! Runs a task's steps in containers against a workspace and extracts the diff.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::core::template::{StepContext, render_step_template};
use crate::core::types::{Step, StepResult, Task};
use crate::error::{ShellProbeError, StepFailedError};
use crate::executor::TaskProgress;
use crate::io::context::RunContext;
use crate::io::docker::{Docker, bind_mount};
use crate::io::fetcher::RepoFetcher;
use crate::io::process::display_command;
use crate::io::task_log::TaskLog;
use crate::io::workspace::{Workspace, WorkspaceCreator, WorkspaceSettings, select_creator};

/// Mount point of the workspace inside step containers.
pub const CONTAINER_WORKDIR: &str = "/work";
/// Shells tried, in order, when probing an image.
const SHELL_CANDIDATES: [&str; 2] = ["/bin/bash", "/bin/sh"];
/// Deadline for cleanup that runs after the task context may have expired.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one task and returns its diff.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// One-time setup before any task runs.
    async fn prepare(&self, _ctx: &RunContext, _tasks: &[Arc<Task>]) -> Result<()> {
        Ok(())
    }

    async fn run_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        log: &TaskLog,
        progress: &TaskProgress,
    ) -> Result<String>;
}

/// Shell found in an image and a scratch path it created for the script.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbedShell {
    shell: String,
    script_path: String,
}

/// [`TaskRunner`] that runs steps with the container runtime CLI.
pub struct DockerTaskRunner {
    docker: Arc<Docker>,
    fetcher: Arc<dyn RepoFetcher>,
    settings: WorkspaceSettings,
    creator: OnceCell<WorkspaceCreator>,
    shells: Mutex<HashMap<String, ProbedShell>>,
}

impl DockerTaskRunner {
    pub fn new(
        docker: Arc<Docker>,
        fetcher: Arc<dyn RepoFetcher>,
        settings: WorkspaceSettings,
    ) -> Self {
        Self {
            docker,
            fetcher,
            settings,
            creator: OnceCell::new(),
            shells: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_images(&self, ctx: &RunContext, images: &[String]) -> Result<()> {
        for image in images {
            self.docker.ensure_image(ctx, image).await?;
        }
        Ok(())
    }

    /// The creator picked on first use; later calls reuse it.
    async fn creator(&self, ctx: &RunContext, images: &[String]) -> Result<&WorkspaceCreator> {
        self.creator
            .get_or_try_init(|| select_creator(ctx, Arc::clone(&self.docker), &self.settings, images))
            .await
    }

    #[instrument(skip(self, ctx))]
    async fn probe_shell(&self, ctx: &RunContext, image: &str) -> Result<ProbedShell> {
        if let Some(found) = self.shells.lock().await.get(image) {
            return Ok(found.clone());
        }

        let mut attempts = Vec::with_capacity(SHELL_CANDIDATES.len());
        for shell in SHELL_CANDIDATES {
            let out = self
                .docker
                .run(ctx, &["run", "--rm", "--entrypoint", shell, image, "-c", "mktemp"])
                .await?;
            let script_path = out.stdout_lossy().trim().to_string();
            if out.success() && !script_path.is_empty() {
                let found = ProbedShell {
                    shell: shell.to_string(),
                    script_path,
                };
                debug!(image, shell, "probed shell");
                self.shells
                    .lock()
                    .await
                    .insert(image.to_string(), found.clone());
                return Ok(found);
            }
            let stderr = out.stderr_lossy();
            attempts.push(format!(
                "{shell}: exit status {:?}: {}",
                out.status.code(),
                stderr.trim()
            ));
        }
        Err(ShellProbeError {
            image: image.to_string(),
            attempts,
        }
        .into())
    }

    async fn run_steps(
        &self,
        ctx: &RunContext,
        task: &Task,
        workspace: &Workspace,
        log: &TaskLog,
        progress: &TaskProgress,
    ) -> Result<Vec<u8>> {
        let total = task.steps.len();
        let mut previous: Option<StepResult> = None;
        for (idx, step) in task.steps.iter().enumerate() {
            let number = idx + 1;
            progress.set_current_step(Some(format!("step {number}/{total}: {}", step.container)));
            log.line(&format!("--- step {number}/{total} ({}) ---", step.container))
                .await;
            let result = self
                .run_step(ctx, task, step, workspace, previous.as_ref(), log)
                .await
                .with_context(|| format!("step {number} in {}", task.repository.name))?;
            previous = Some(result);
        }

        progress.set_current_step(Some("computing diff".to_string()));
        workspace.diff(ctx).await.context("compute diff")
    }

    async fn run_step(
        &self,
        ctx: &RunContext,
        task: &Task,
        step: &Step,
        workspace: &Workspace,
        previous: Option<&StepResult>,
        log: &TaskLog,
    ) -> Result<StepResult> {
        let shell = self.probe_shell(ctx, &step.container).await?;
        let template_ctx = StepContext::new(&task.repository, previous);

        let script = render_step_template("run", &step.run, template_ctx)?;
        let script_file = write_mount_file("script", &script)?;

        let mut files = Vec::with_capacity(step.files.len());
        for (target, source) in &step.files {
            let content = render_step_template(target, source, template_ctx)?;
            files.push((write_mount_file("file", &content)?, target.as_str()));
        }

        let mut env = BTreeMap::new();
        for (name, value) in step.env.resolve_from_host()? {
            let rendered = render_step_template(&format!("env {name}"), &value, template_ctx)?;
            env.insert(name, rendered);
        }

        // The runtime refuses to overwrite an existing cid file, so it goes in
        // a fresh directory rather than a pre-created temp file.
        let cid_dir = tempfile::Builder::new()
            .prefix("campaign-exec-cid-")
            .tempdir()
            .context("create cid dir")?;
        let cidfile = cid_dir.path().join("cid");

        let mounts: Vec<(&Path, &str)> = files
            .iter()
            .map(|(file, target)| (file.path(), *target))
            .collect();
        let args = docker_run_args(&RunSpec {
            image: &step.container,
            shell: &shell,
            cidfile: &cidfile,
            script_host: script_file.path(),
            files: &mounts,
            workspace_opts: workspace.docker_run_opts(CONTAINER_WORKDIR),
            env: &env,
        });
        let command = display_command(self.docker.program(), &args);
        log.line(&format!("$ {command}")).await;
        log.section("script", &script).await;

        let outcome = self.docker.run(ctx, &args).await;
        self.remove_container(&cidfile).await;
        let out = outcome?;

        let stdout = format!(
            "{}{}",
            out.stdout_lossy(),
            out.stdout_truncated_notice(&step.container)
        );
        let stderr = format!(
            "{}{}",
            out.stderr_lossy(),
            out.stderr_truncated_notice(&step.container)
        );
        log.section("stdout", &stdout).await;
        log.section("stderr", &stderr).await;

        if !out.success() {
            return Err(StepFailedError {
                command,
                exit_code: out.status.code(),
                stdout,
                stderr,
                run_script: script,
            }
            .into());
        }

        let changes = workspace.changes(ctx).await.context("list changed files")?;
        debug!(
            modified = changes.modified.len(),
            added = changes.added.len(),
            deleted = changes.deleted.len(),
            renamed = changes.renamed.len(),
            "step finished"
        );
        Ok(StepResult {
            changes,
            stdout,
            stderr,
        })
    }

    /// Force-remove the container recorded in `cidfile`, if it got that far.
    async fn remove_container(&self, cidfile: &Path) {
        let id = match tokio::fs::read_to_string(cidfile).await {
            Ok(id) => id.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %cidfile.display(), err = %err, "failed to read cid file");
                return;
            }
        };
        if id.is_empty() {
            return;
        }
        let cleanup = RunContext::detached(CLEANUP_TIMEOUT);
        self.docker.force_remove_container(&cleanup, &id).await;
    }
}

#[async_trait]
impl TaskRunner for DockerTaskRunner {
    async fn prepare(&self, ctx: &RunContext, tasks: &[Arc<Task>]) -> Result<()> {
        let images = distinct_images(tasks.iter().map(|task| &**task));
        info!(images = images.len(), "preparing images");
        self.ensure_images(ctx, &images).await?;
        self.creator(ctx, &images).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %task.repository.name))]
    async fn run_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        log: &TaskLog,
        progress: &TaskProgress,
    ) -> Result<String> {
        let images = distinct_images(std::iter::once(task));
        self.ensure_images(ctx, &images).await?;
        let creator = self.creator(ctx, &images).await?;

        progress.set_current_step(Some("fetching".to_string()));
        let archive = self
            .fetcher
            .fetch(ctx, &task.repository)
            .await
            .with_context(|| format!("fetch {}", task.repository.name))?;

        progress.set_current_step(Some("creating workspace".to_string()));
        let workspace = creator
            .create(ctx, &task.repository, &archive)
            .await
            .with_context(|| format!("create workspace for {}", task.repository.name))?;
        log.line(&format!("workspace: {}", creator.kind())).await;

        let result = self.run_steps(ctx, task, &workspace, log, progress).await;

        let cleanup = RunContext::detached(CLEANUP_TIMEOUT);
        if let Err(err) = workspace.close(&cleanup).await {
            warn!(err = %format!("{err:#}"), "failed to remove workspace");
        }
        progress.set_current_step(None);

        let diff = result?;
        String::from_utf8(diff).context("diff is not valid UTF-8")
    }
}

/// Images referenced by `tasks`, sorted and deduplicated.
fn distinct_images<'a>(tasks: impl Iterator<Item = &'a Task>) -> Vec<String> {
    tasks
        .flat_map(|task| task.steps.iter().map(|step| step.container.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Rendered content written to a host file that containers can read.
fn write_mount_file(kind: &str, content: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("campaign-exec-{kind}-"))
        .permissions(std::fs::Permissions::from_mode(0o644))
        .tempfile()
        .with_context(|| format!("create {kind} file"))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("write {kind} file {}", file.path().display()))?;
    Ok(file)
}

struct RunSpec<'a> {
    image: &'a str,
    shell: &'a ProbedShell,
    cidfile: &'a Path,
    script_host: &'a Path,
    /// Host file and in-container target for each extra mount.
    files: &'a [(&'a Path, &'a str)],
    workspace_opts: Vec<String>,
    env: &'a BTreeMap<String, String>,
}

fn docker_run_args(spec: &RunSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--init".to_string(),
        "--cidfile".to_string(),
        spec.cidfile.display().to_string(),
        "--workdir".to_string(),
        CONTAINER_WORKDIR.to_string(),
    ];
    args.extend(bind_mount(spec.script_host, &spec.shell.script_path, true));
    for (host, target) in spec.files {
        args.extend(bind_mount(host, target, true));
    }
    args.extend(spec.workspace_opts.iter().cloned());
    for (name, value) in spec.env {
        args.push("-e".to_string());
        args.push(format!("{name}={value}"));
    }
    args.extend([
        "--entrypoint".to_string(),
        spec.shell.shell.clone(),
        spec.image.to_string(),
        spec.shell.script_path.clone(),
    ]);
    args
}
