//! End-to-end executor scenarios driven by a scripted runner.
//!
//! These tests exercise scheduling, caching, timeouts and cancellation without
//! a container runtime: the runner replays canned diffs per repository.

use std::sync::Arc;
use std::time::Duration;

use campaign_exec::core::types::ChangesetSpec;
use campaign_exec::executor::{Executor, ExecutorOptions, TaskState};
use campaign_exec::io::cache::{DiskCache, ExecutionCache};
use campaign_exec::io::context::RunContext;
use campaign_exec::io::task_log::LogManager;
use campaign_exec::test_support::{MemoryCache, ScriptedRunner, repository, step, template};

const DIFF_API: &str = "diff --git README.md README.md\n--- README.md\n+++ README.md\n@@ -1 +1 @@\n-old\n+new\n";
const DIFF_WEB: &str = "diff --git main.go main.go\n--- main.go\n+++ main.go\n@@ -1 +1 @@\n-a\n+b\n";

fn options(parallelism: usize, timeout: Duration) -> ExecutorOptions {
    ExecutorOptions {
        parallelism,
        timeout,
        clear_cache: false,
    }
}

fn executor(
    opts: ExecutorOptions,
    runner: &Arc<ScriptedRunner>,
    cache: Arc<dyn ExecutionCache>,
    logs: &tempfile::TempDir,
) -> Executor {
    Executor::new(
        opts,
        Arc::clone(runner) as _,
        cache,
        LogManager::new(logs.path(), false),
    )
}

fn add(executor: &mut Executor, names: &[&str]) {
    for name in names {
        executor
            .add_task(repository(name), vec![step("alpine:3", "sed -i s/old/new/ README.md")], template())
            .expect("add task");
    }
}

fn sorted(mut specs: Vec<ChangesetSpec>) -> Vec<ChangesetSpec> {
    specs.sort_by(|a, b| a.base_repository.cmp(&b.base_repository));
    specs
}

#[tokio::test]
async fn two_repositories_then_rerun_from_disk_cache() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache: Arc<dyn ExecutionCache> = Arc::new(DiskCache::new(temp.path().join("cache")));

    let runner = Arc::new(
        ScriptedRunner::default()
            .with_diff("github.com/acme/api", DIFF_API)
            .with_diff("github.com/acme/web", DIFF_WEB),
    );
    let mut first = executor(options(2, Duration::from_secs(5)), &runner, Arc::clone(&cache), &temp);
    add(&mut first, &["github.com/acme/api", "github.com/acme/web"]);
    first.start(&RunContext::background()).expect("start");
    let specs = sorted(first.wait().await.expect("first run"));

    assert_eq!(runner.calls(), 2);
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].base_repository, "id-github.com/acme/api");
    assert_eq!(specs[0].head_ref, "refs/heads/update-things");
    assert_eq!(specs[0].diff(), Some(DIFF_API));
    assert_eq!(specs[1].diff(), Some(DIFF_WEB));

    let fresh_runner = Arc::new(ScriptedRunner::default());
    let mut second = executor(options(2, Duration::from_secs(5)), &fresh_runner, cache, &temp);
    add(&mut second, &["github.com/acme/api", "github.com/acme/web"]);
    second.start(&RunContext::background()).expect("start");
    let cached_specs = sorted(second.wait().await.expect("second run"));

    assert_eq!(fresh_runner.calls(), 0);
    assert_eq!(cached_specs, specs);
    let statuses = second.task_statuses();
    assert!(statuses.iter().all(|s| s.cached && s.state() == TaskState::Finished));
    assert!(statuses.iter().all(|s| s.log_file.is_none()));
}

#[tokio::test]
async fn cached_diff_uses_current_template() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::default());
    let runner = Arc::new(ScriptedRunner::default().with_diff("github.com/acme/api", DIFF_API));

    let mut first = executor(options(1, Duration::from_secs(5)), &runner, cache.clone(), &temp);
    add(&mut first, &["github.com/acme/api"]);
    first.start(&RunContext::background()).expect("start");
    first.wait().await.expect("first run");

    let mut renamed = template();
    renamed.title = "Renamed".to_string();
    renamed.branch = "refs/heads/renamed".to_string();
    let mut second = executor(options(1, Duration::from_secs(5)), &runner, cache, &temp);
    second
        .add_task(repository("github.com/acme/api"), vec![step("alpine:3", "sed -i s/old/new/ README.md")], renamed)
        .expect("add");
    second.start(&RunContext::background()).expect("start");
    let specs = second.wait().await.expect("second run");

    assert_eq!(runner.calls(), 1);
    assert_eq!(specs[0].title, "Renamed");
    assert_eq!(specs[0].head_ref, "refs/heads/renamed");
    assert_eq!(specs[0].diff(), Some(DIFF_API));
}

#[tokio::test]
async fn parallelism_bounds_concurrent_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::default().with_delay(Duration::from_millis(50)));
    let mut exec = executor(
        options(2, Duration::from_secs(5)),
        &runner,
        Arc::new(MemoryCache::default()),
        &temp,
    );
    let names: Vec<String> = (0..6).map(|i| format!("github.com/acme/repo{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    add(&mut exec, &refs);
    exec.start(&RunContext::background()).expect("start");
    exec.wait().await.expect("wait");

    assert_eq!(runner.calls(), 6);
    assert!(runner.max_concurrency() <= 2, "saw {}", runner.max_concurrency());
    assert!(runner.max_concurrency() >= 1);
}

#[tokio::test]
async fn timeout_is_distinct_from_step_failure_and_not_cached() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::default());
    let runner = Arc::new(ScriptedRunner::default().with_hang("github.com/acme/slow"));
    let mut exec = executor(options(1, Duration::from_millis(100)), &runner, cache.clone(), &temp);
    add(&mut exec, &["github.com/acme/slow"]);
    exec.start(&RunContext::background()).expect("start");

    let err = exec.wait().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.repo_name, "github.com/acme/slow");
    assert!(
        err.to_string()
            .contains("execution took longer than the configured timeout of 100ms")
    );
    assert!(err.log_file.as_ref().is_some_and(|p| p.exists()));
    assert!(cache.is_empty());

    let failing = Arc::new(ScriptedRunner::default().with_failure("github.com/acme/bad", "sed: no such file"));
    let mut exec = executor(options(1, Duration::from_secs(5)), &failing, cache.clone(), &temp);
    add(&mut exec, &["github.com/acme/bad"]);
    exec.start(&RunContext::background()).expect("start");
    let err = exec.wait().await.unwrap_err();
    assert!(!err.is_timeout());
    assert_eq!(err.summary(), "sed: no such file");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn failing_task_does_not_stop_others() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(
        ScriptedRunner::default()
            .with_failure("github.com/acme/bad", "boom")
            .with_diff("github.com/acme/api", DIFF_API),
    );
    let mut exec = executor(
        options(1, Duration::from_secs(5)),
        &runner,
        Arc::new(MemoryCache::default()),
        &temp,
    );
    add(&mut exec, &["github.com/acme/bad", "github.com/acme/api"]);
    exec.start(&RunContext::background()).expect("start");

    let err = exec.wait().await.unwrap_err();
    assert_eq!(err.repo_name, "github.com/acme/bad");
    assert_eq!(runner.calls(), 2);
    let produced = exec.changeset_specs();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].diff(), Some(DIFF_API));
}

#[tokio::test]
async fn empty_diff_is_cached_without_spec() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::default());
    let runner = Arc::new(ScriptedRunner::default());

    let mut first = executor(options(1, Duration::from_secs(5)), &runner, cache.clone(), &temp);
    add(&mut first, &["github.com/acme/api"]);
    first.start(&RunContext::background()).expect("start");
    assert!(first.wait().await.expect("first run").is_empty());
    assert_eq!(cache.len(), 1);

    let mut second = executor(options(1, Duration::from_secs(5)), &runner, cache.clone(), &temp);
    add(&mut second, &["github.com/acme/api"]);
    second.start(&RunContext::background()).expect("start");
    assert!(second.wait().await.expect("second run").is_empty());
    assert_eq!(runner.calls(), 1);
    second.locked_task_statuses(|statuses| {
        assert!(statuses[0].cached);
        assert!(statuses[0].changeset_spec.is_none());
    });
}

#[tokio::test]
async fn clear_cache_forces_rerun() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::default());
    let runner = Arc::new(ScriptedRunner::default().with_diff("github.com/acme/api", DIFF_API));

    let mut first = executor(options(1, Duration::from_secs(5)), &runner, cache.clone(), &temp);
    add(&mut first, &["github.com/acme/api"]);
    first.start(&RunContext::background()).expect("start");
    first.wait().await.expect("first run");

    let opts = ExecutorOptions {
        clear_cache: true,
        ..options(1, Duration::from_secs(5))
    };
    let mut second = executor(opts, &runner, cache.clone(), &temp);
    add(&mut second, &["github.com/acme/api"]);
    second.start(&RunContext::background()).expect("start");
    let specs = second.wait().await.expect("second run");

    assert_eq!(runner.calls(), 2);
    assert_eq!(specs.len(), 1);
    assert!(!second.task_statuses()[0].cached);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn cancelled_context_launches_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::default().with_diff("github.com/acme/api", DIFF_API));
    let mut exec = executor(
        options(1, Duration::from_secs(5)),
        &runner,
        Arc::new(MemoryCache::default()),
        &temp,
    );
    add(&mut exec, &["github.com/acme/api", "github.com/acme/web"]);

    let ctx = RunContext::background();
    ctx.cancel();
    exec.start(&ctx).expect("start");
    let specs = exec.wait().await.expect("wait");

    assert!(specs.is_empty());
    assert_eq!(runner.calls(), 0);
    assert!(
        exec.task_statuses()
            .iter()
            .all(|s| s.state() == TaskState::Enqueued)
    );
}
