//! Test-only fakes and builders for tasks, runners and caches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::cache_key::ExecutionCacheKey;
use crate::core::env::Environment;
use crate::core::types::{
    Branch, ChangesetTemplate, CommitTemplate, ExecutionResult, Repository, Step, Task,
};
use crate::error::StepFailedError;
use crate::executor::TaskProgress;
use crate::io::cache::ExecutionCache;
use crate::io::context::RunContext;
use crate::io::fetcher::RepoFetcher;
use crate::io::step_runner::TaskRunner;
use crate::io::task_log::TaskLog;

/// Repository with a deterministic id and an unresolved revision.
pub fn repository(name: &str) -> Repository {
    Repository {
        id: format!("id-{name}"),
        name: name.to_string(),
        default_branch: Branch {
            name: "refs/heads/main".to_string(),
            target_oid: String::new(),
        },
        file_matches: BTreeSet::new(),
    }
}

pub fn step(container: &str, run: &str) -> Step {
    Step {
        run: run.to_string(),
        container: container.to_string(),
        env: Environment::default(),
        files: BTreeMap::new(),
    }
}

pub fn template() -> ChangesetTemplate {
    ChangesetTemplate {
        title: "Update things".to_string(),
        body: "Automated change".to_string(),
        branch: "update-things".to_string(),
        commit: CommitTemplate {
            message: "Update things".to_string(),
            author: None,
        },
        published: false,
    }
}

pub fn task(repository: Repository, steps: Vec<Step>) -> Task {
    Task {
        repository,
        steps,
        template: template(),
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Diff(String),
    Fail(String),
    StepFail { exit_code: i32, stderr: String },
    /// Never finishes on its own; only the task deadline ends it.
    Hang,
}

/// [`TaskRunner`] that replays canned outcomes per repository name.
///
/// Unscripted repositories succeed with an empty diff.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: HashMap<String, Scripted>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedRunner {
    pub fn with_diff(mut self, repo: &str, diff: &str) -> Self {
        self.outcomes
            .insert(repo.to_string(), Scripted::Diff(diff.to_string()));
        self
    }

    pub fn with_failure(mut self, repo: &str, message: &str) -> Self {
        self.outcomes
            .insert(repo.to_string(), Scripted::Fail(message.to_string()));
        self
    }

    /// Fail like a step container exiting with `exit_code`.
    pub fn with_step_failure(mut self, repo: &str, exit_code: i32, stderr: &str) -> Self {
        self.outcomes.insert(
            repo.to_string(),
            Scripted::StepFail {
                exit_code,
                stderr: stderr.to_string(),
            },
        );
        self
    }

    pub fn with_hang(mut self, repo: &str) -> Self {
        self.outcomes.insert(repo.to_string(), Scripted::Hang);
        self
    }

    /// Time every run takes before producing its outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `run_task` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        log: &TaskLog,
        progress: &TaskProgress,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        progress.set_current_step(Some(format!("step 1/1: {}", task.repository.name)));
        log.line(&format!("scripted run for {}", task.repository.name))
            .await;
        ctx.sleep(self.delay).await?;

        match self.outcomes.get(&task.repository.name) {
            None => Ok(String::new()),
            Some(Scripted::Diff(diff)) => Ok(diff.clone()),
            Some(Scripted::Fail(message)) => Err(anyhow!("{message}")),
            Some(Scripted::StepFail { exit_code, stderr }) => Err(StepFailedError {
                command: format!("docker run {}", task.repository.name),
                exit_code: Some(*exit_code),
                stdout: String::new(),
                stderr: stderr.clone(),
                run_script: task
                    .steps
                    .iter()
                    .map(|step| step.run.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            }
            .into()),
            Some(Scripted::Hang) => {
                ctx.run(std::future::pending::<()>()).await?;
                Err(anyhow!("hang ended without interruption"))
            }
        }
    }
}

/// In-memory [`ExecutionCache`] keyed by the rendered cache key.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, ExecutionResult>>,
}

impl MemoryCache {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, ExecutionResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn get_raw(&self, key: &ExecutionCacheKey) -> Option<ExecutionResult> {
        self.entries().get(&key.key()).cloned()
    }
}

#[async_trait]
impl ExecutionCache for MemoryCache {
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>> {
        Ok(self.get_raw(key))
    }

    async fn set(&self, key: &ExecutionCacheKey, result: &ExecutionResult) -> Result<()> {
        self.entries().insert(key.key(), result.clone());
        Ok(())
    }

    async fn clear(&self, key: &ExecutionCacheKey) -> Result<()> {
        self.entries().remove(&key.key());
        Ok(())
    }
}

/// Pack `files` (relative path, content) into `<dir>/repo.tar`.
pub fn tar_archive(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
    let tree = dir.join("tree");
    for (path, content) in files {
        let target = tree.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).expect("create archive dir");
        }
        fs::write(target, content).expect("write archive file");
    }
    fs::create_dir_all(&tree).expect("create archive tree");
    let archive = dir.join("repo.tar");
    let status = Command::new("tar")
        .arg("-cf")
        .arg(&archive)
        .arg("-C")
        .arg(&tree)
        .arg(".")
        .status()
        .expect("run tar");
    assert!(status.success(), "tar failed");
    archive
}

/// [`RepoFetcher`] that hands out one prebuilt archive for every repository.
#[derive(Debug, Clone)]
pub struct FixedArchiveFetcher {
    archive: PathBuf,
}

impl FixedArchiveFetcher {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
        }
    }
}

#[async_trait]
impl RepoFetcher for FixedArchiveFetcher {
    async fn fetch(&self, _ctx: &RunContext, _repo: &Repository) -> Result<PathBuf> {
        Ok(self.archive.clone())
    }
}

const FAKE_RUNTIME_SCRIPT: &str = r#"#!/bin/sh
dir='@DIR@'
printf '%s\n' "$*" >> "$dir/calls.log"
case "$1 $2" in
  "image inspect") echo sha256:fake; exit 0 ;;
  "image pull") exit 0 ;;
  "volume create") echo fake-volume; exit 0 ;;
  "volume rm") exit 0 ;;
esac
case "$1" in
  rm) exit 0 ;;
  run) shift ;;
  *) echo "unsupported: $*" >&2; exit 2 ;;
esac
cidfile=''
work=''
mounts=''
entry=''
while [ $# -gt 0 ]; do
  case "$1" in
    --rm|--init) shift ;;
    --workdir) shift 2 ;;
    --cidfile) cidfile=$2; shift 2 ;;
    --mount)
      src=${2#*source=}; src=${src%%,*}
      tgt=${2#*target=}; tgt=${tgt%%,*}
      if [ "$tgt" = /work ]; then work=$src; else mounts="$mounts $tgt=$src"; fi
      shift 2 ;;
    -e) export "$2"; shift 2 ;;
    --entrypoint) entry=$2; shift 2 ;;
    *) break ;;
  esac
done
shift
case " @SHELLS@ " in
  *" $entry "*) ;;
  *) echo "exec: $entry: not found" >&2; exit 127 ;;
esac
if [ "$1" = -c ]; then
  if [ "$2" = mktemp ]; then echo /tmp/fake-step-script; exit 0; fi
  cat "$dir/helper.out" 2>/dev/null
  exit 0
fi
script=''
for pair in $mounts; do
  if [ "${pair%%=*}" = "$1" ]; then script=${pair#*=}; fi
done
if [ -n "$cidfile" ]; then echo fake-container > "$cidfile"; fi
cd "$work" || exit 125
exec /bin/sh "$script"
"#;

/// Stand-in for the container runtime CLI.
///
/// Every invocation is appended to a call log. Step containers run their
/// script with the host `/bin/sh` inside the bind-mounted workspace; helper
/// containers (`-c <script>`) print whatever [`FakeRuntime::with_helper_output`]
/// stored. Images only provide the shells passed to [`FakeRuntime::new`].
#[derive(Debug)]
pub struct FakeRuntime {
    dir: TempDir,
}

impl FakeRuntime {
    pub fn new(shells: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = FAKE_RUNTIME_SCRIPT
            .replace("@DIR@", &dir.path().display().to_string())
            .replace("@SHELLS@", &shells.join(" "));
        let program = dir.path().join("runtime");
        fs::write(&program, script).expect("write fake runtime");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod");
        Self { dir }
    }

    /// Stdout of every helper container from now on.
    pub fn with_helper_output(self, output: &[u8]) -> Self {
        fs::write(self.dir.path().join("helper.out"), output).expect("write helper output");
        self
    }

    pub fn program(&self) -> String {
        self.dir.path().join("runtime").display().to_string()
    }

    /// Arguments of every invocation so far, one per line.
    pub fn calls(&self) -> String {
        fs::read_to_string(self.dir.path().join("calls.log")).unwrap_or_default()
    }
}
