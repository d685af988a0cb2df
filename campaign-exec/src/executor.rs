//! Bounded-parallelism task scheduler.
//!
//! Each queued task runs in its own tokio task once it holds a semaphore
//! permit. A task consults the execution cache before anything is fetched or
//! started, and only a successful run writes back to it. Status is tracked per
//! task and handed out as snapshots; produced specs are collected under a
//! separate lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::core::cache_key::ExecutionCacheKey;
use crate::core::changeset::build_changeset_spec;
use crate::core::types::{ChangesetSpec, ChangesetTemplate, ExecutionResult, Repository, Step, Task};
use crate::error::{Interrupted, StepFailedError, TaskError, TimeoutExceeded};
use crate::io::cache::ExecutionCache;
use crate::io::config::ExecutorConfig;
use crate::io::context::RunContext;
use crate::io::step_runner::TaskRunner;
use crate::io::task_log::LogManager;

/// Knobs the executor needs from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub parallelism: usize,
    pub timeout: Duration,
    /// Drop existing cache entries instead of reading them.
    pub clear_cache: bool,
}

impl ExecutorOptions {
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self {
            parallelism: cfg.parallelism,
            timeout: cfg.timeout(),
            clear_cache: cfg.clear_cache,
        }
    }
}

/// Where a task is in its lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Enqueued,
    Running,
    Finished,
}

/// Live record of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub repo_name: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Result came from the execution cache.
    pub cached: bool,
    /// Human-readable description of what the task is doing right now.
    pub current_step: Option<String>,
    pub changeset_spec: Option<ChangesetSpec>,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl TaskStatus {
    fn new(repo_name: &str) -> Self {
        Self {
            repo_name: repo_name.to_string(),
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cached: false,
            current_step: None,
            changeset_spec: None,
            error: None,
            log_file: None,
        }
    }

    pub fn state(&self) -> TaskState {
        if self.finished_at.is_some() {
            TaskState::Finished
        } else if self.started_at.is_some() {
            TaskState::Running
        } else {
            TaskState::Enqueued
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Wall-clock time between start and finish, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

type Statuses = Arc<RwLock<Vec<TaskStatus>>>;

fn read(statuses: &Statuses) -> RwLockReadGuard<'_, Vec<TaskStatus>> {
    statuses.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(statuses: &Statuses) -> RwLockWriteGuard<'_, Vec<TaskStatus>> {
    statuses.write().unwrap_or_else(PoisonError::into_inner)
}

/// Handle a running task uses to update its own status.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    statuses: Statuses,
    index: usize,
}

impl TaskProgress {
    /// Progress handle not attached to any executor, for driving a runner directly.
    pub fn detached(repo_name: &str) -> Self {
        Self {
            statuses: Arc::new(RwLock::new(vec![TaskStatus::new(repo_name)])),
            index: 0,
        }
    }

    pub fn set_current_step(&self, step: Option<String>) {
        self.update(|status| status.current_step = step);
    }

    /// Current snapshot of this task's status.
    pub fn status(&self) -> Option<TaskStatus> {
        read(&self.statuses).get(self.index).cloned()
    }

    fn update(&self, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(status) = write(&self.statuses).get_mut(self.index) {
            f(status);
        }
    }
}

/// Queue of tasks executed with bounded parallelism.
pub struct Executor {
    shared: Arc<Shared>,
    parallelism: usize,
    pending: Vec<Arc<Task>>,
    driver: Option<JoinHandle<Option<TaskError>>>,
}

struct Shared {
    runner: Arc<dyn TaskRunner>,
    cache: Arc<dyn ExecutionCache>,
    logs: LogManager,
    timeout: Duration,
    clear_cache: bool,
    statuses: Statuses,
    specs: Mutex<Vec<ChangesetSpec>>,
}

/// What a finished task produced.
struct Outcome {
    cached: bool,
    spec: Option<ChangesetSpec>,
    log_file: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        opts: ExecutorOptions,
        runner: Arc<dyn TaskRunner>,
        cache: Arc<dyn ExecutionCache>,
        logs: LogManager,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                cache,
                logs,
                timeout: opts.timeout,
                clear_cache: opts.clear_cache,
                statuses: Arc::new(RwLock::new(Vec::new())),
                specs: Mutex::new(Vec::new()),
            }),
            parallelism: opts.parallelism.max(1),
            pending: Vec::new(),
            driver: None,
        }
    }

    /// Queue a task. Fails once the executor has been started.
    pub fn add_task(
        &mut self,
        repository: Repository,
        steps: Vec<Step>,
        template: ChangesetTemplate,
    ) -> anyhow::Result<()> {
        if self.driver.is_some() {
            return Err(anyhow!(
                "cannot add task for {} after the executor started",
                repository.name
            ));
        }
        write(&self.shared.statuses).push(TaskStatus::new(&repository.name));
        self.pending.push(Arc::new(Task {
            repository,
            steps,
            template,
        }));
        Ok(())
    }

    /// Tasks queued so far, in insertion order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.pending
    }

    /// Launch queued tasks in the background and return immediately.
    ///
    /// Cancelling `ctx` stops tasks that have not started yet. Tasks already
    /// running only answer to their own timeout.
    pub fn start(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        if self.driver.is_some() {
            return Err(anyhow!("executor already started"));
        }
        let tasks = std::mem::take(&mut self.pending);
        let shared = Arc::clone(&self.shared);
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let ctx = ctx.clone();
        info!(tasks = tasks.len(), parallelism = self.parallelism, "starting executor");
        self.driver = Some(tokio::spawn(drive(ctx, shared, semaphore, tasks)));
        Ok(())
    }

    /// Wait for every launched task. Returns all produced specs, or the first
    /// task failure observed.
    pub async fn wait(&mut self) -> Result<Vec<ChangesetSpec>, TaskError> {
        if let Some(driver) = self.driver.take() {
            let first_error = driver.await.map_err(|err| {
                TaskError::new("executor", None, anyhow!("task driver failed: {err}"))
            })?;
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        Ok(self.changeset_specs())
    }

    /// Specs produced so far, in completion order.
    pub fn changeset_specs(&self) -> Vec<ChangesetSpec> {
        self.shared
            .specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `f` with a consistent snapshot of every task's status. The lock is
    /// released before `f` runs.
    pub fn locked_task_statuses<R>(&self, f: impl FnOnce(&[TaskStatus]) -> R) -> R {
        let snapshot = self.task_statuses();
        f(&snapshot)
    }

    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        read(&self.shared.statuses).clone()
    }
}

async fn drive(
    ctx: RunContext,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    tasks: Vec<Arc<Task>>,
) -> Option<TaskError> {
    let mut running = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let permit = match ctx.run(Arc::clone(&semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => break,
            Err(reason) => {
                info!(%reason, remaining_from = index, "not launching further tasks");
                break;
            }
        };
        let shared = Arc::clone(&shared);
        running.spawn(async move {
            let _permit = permit;
            shared.run_task(index, task).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = running.join_next().await {
        let result = joined.unwrap_or_else(|err| {
            Err(TaskError::new("executor", None, anyhow!("task panicked: {err}")))
        });
        if let Err(err) = result {
            warn!(repo = %err.repo_name, err = %err, "task failed");
            first_error.get_or_insert(err);
        }
    }
    first_error
}

impl Shared {
    #[instrument(skip_all, fields(repo = %task.repository.name))]
    async fn run_task(&self, index: usize, task: Arc<Task>) -> Result<(), TaskError> {
        let progress = TaskProgress {
            statuses: Arc::clone(&self.statuses),
            index,
        };
        progress.update(|status| status.started_at = Some(Utc::now()));

        let result = self.execute(&task, &progress).await;
        let finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                debug!(cached = outcome.cached, has_spec = outcome.spec.is_some(), "task finished");
                progress.update(|status| {
                    status.finished_at = finished_at;
                    status.current_step = None;
                    status.cached = outcome.cached;
                    status.log_file = outcome.log_file;
                    status.changeset_spec = outcome.spec.clone();
                });
                if let Some(spec) = outcome.spec {
                    self.specs
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(spec);
                }
                Ok(())
            }
            Err(err) => {
                progress.update(|status| {
                    status.finished_at = finished_at;
                    status.current_step = None;
                    status.error = Some(err.summary());
                    status.log_file = err.log_file.clone();
                });
                Err(err)
            }
        }
    }

    async fn execute(&self, task: &Task, progress: &TaskProgress) -> Result<Outcome, TaskError> {
        let repo_name = task.repository.name.as_str();
        let fail = |cause: anyhow::Error| TaskError::new(repo_name, None, cause);

        let key = ExecutionCacheKey::from_host(task).map_err(|err| fail(err.into()))?;
        if self.clear_cache {
            self.cache.clear(&key).await.map_err(fail)?;
        } else if let Some(hit) = self.cache.get(&key).await.map_err(fail)? {
            info!(key = %key.key(), "served from cache");
            return Ok(Outcome {
                cached: true,
                spec: spec_for(task, &hit.diff),
                log_file: None,
            });
        }

        let log = self
            .logs
            .create(&task.repository)
            .await
            .map_err(fail)?;
        let ctx = RunContext::detached(self.timeout);
        let mut result = self
            .runner
            .run_task(&ctx, task, &log, progress)
            .await
            .map_err(|err| self.classify(&ctx, err));

        // Only a completed run is cached; an interrupted one never is.
        if let Ok(diff) = &result {
            let entry = ExecutionResult { diff: diff.clone() };
            if let Err(err) = self.cache.set(&key, &entry).await {
                result = Err(err.context("write cache entry"));
            }
        }

        if let Err(err) = &result {
            log.section("error", &format!("{err:#}")).await;
            let details = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<StepFailedError>())
                .map(StepFailedError::details);
            if let Some(details) = details {
                log.section("failed step", &details).await;
            }
        }
        let log_file = self.logs.finish(log, result.is_ok()).await;

        match result {
            Ok(diff) => Ok(Outcome {
                cached: false,
                spec: spec_for(task, &diff),
                log_file,
            }),
            Err(cause) => Err(TaskError::new(repo_name, log_file, cause)),
        }
    }

    /// Tag errors caused by the task deadline so callers can tell them from
    /// step failures.
    fn classify(&self, ctx: &RunContext, err: anyhow::Error) -> anyhow::Error {
        let hit_deadline = ctx.deadline_exceeded()
            || err
                .chain()
                .any(|cause| cause.downcast_ref::<Interrupted>() == Some(&Interrupted::DeadlineExceeded));
        if hit_deadline {
            err.context(TimeoutExceeded {
                timeout: self.timeout,
            })
        } else {
            err
        }
    }
}

/// An empty diff means the steps changed nothing: no spec.
fn spec_for(task: &Task, diff: &str) -> Option<ChangesetSpec> {
    if diff.is_empty() {
        None
    } else {
        Some(build_changeset_spec(task, diff))
    }
}
