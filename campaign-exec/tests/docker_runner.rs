//! `DockerTaskRunner` against a fake container runtime.
//!
//! The fake runs step scripts with the host shell inside bind workspaces, so
//! these tests cover probing, templating across steps, diffs and cleanup
//! without a real container engine.

use std::sync::Arc;

use campaign_exec::core::types::Task;
use campaign_exec::error::{ShellProbeError, StepFailedError};
use campaign_exec::executor::TaskProgress;
use campaign_exec::io::context::RunContext;
use campaign_exec::io::docker::Docker;
use campaign_exec::io::step_runner::{DockerTaskRunner, TaskRunner};
use campaign_exec::io::task_log::LogManager;
use campaign_exec::io::workspace::{DEFAULT_VOLUME_WORKSPACE_IMAGE, WorkspaceMode, WorkspaceSettings};
use campaign_exec::test_support::{FakeRuntime, FixedArchiveFetcher, repository, step, tar_archive, task};

const REPO: &str = "github.com/acme/api";

struct Harness {
    temp: tempfile::TempDir,
    runtime: FakeRuntime,
    runner: DockerTaskRunner,
}

impl Harness {
    fn new(shells: &[&str]) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = tar_archive(temp.path(), &[("README.md", "old\n"), ("src/lib.rs", "fn a() {}\n")]);
        let runtime = FakeRuntime::new(shells);
        let runner = DockerTaskRunner::new(
            Arc::new(Docker::new(runtime.program())),
            Arc::new(FixedArchiveFetcher::new(archive)),
            WorkspaceSettings {
                mode: WorkspaceMode::Bind,
                temp_dir: Some(temp.path().join("workspaces")),
                volume_image: DEFAULT_VOLUME_WORKSPACE_IMAGE.to_string(),
            },
        );
        Self {
            temp,
            runtime,
            runner,
        }
    }

    async fn run(&self, task: &Task) -> anyhow::Result<String> {
        let logs = LogManager::new(self.temp.path().join("logs"), true);
        let log = logs.create(&task.repository).await.expect("log");
        let progress = TaskProgress::detached(&task.repository.name);
        self.runner
            .run_task(&RunContext::background(), task, &log, &progress)
            .await
    }

    fn workspaces_left(&self) -> usize {
        let dir = self.temp.path().join("workspaces");
        if !dir.exists() {
            return 0;
        }
        std::fs::read_dir(dir).expect("read_dir").count()
    }
}

#[tokio::test]
async fn steps_see_previous_changes_and_produce_diff() {
    let harness = Harness::new(&["/bin/sh"]);
    let task = task(
        repository(REPO),
        vec![
            step("alpine:3", "printf 'new\\n' > README.md\nprintf 'x\\n' > added.txt"),
            step(
                "alpine:3",
                "echo '${{ previous_step.added_files }}|${{ previous_step.modified_files }}' > seen.txt",
            ),
        ],
    );

    let diff = harness.run(&task).await.expect("run");

    assert!(diff.contains("diff --git README.md README.md"));
    assert!(diff.contains("-old\n+new\n"));
    assert!(diff.contains("diff --git seen.txt seen.txt"));
    assert!(diff.contains("+added.txt|README.md\n"));
    assert_eq!(harness.workspaces_left(), 0);
}

#[tokio::test]
async fn shell_probe_falls_back_and_is_cached_per_image() {
    let harness = Harness::new(&["/bin/sh"]);
    let task = task(
        repository(REPO),
        vec![step("alpine:3", "true"), step("alpine:3", "true")],
    );

    harness.run(&task).await.expect("run");

    let calls = harness.runtime.calls();
    assert_eq!(calls.matches("--entrypoint /bin/bash alpine:3 -c mktemp").count(), 1);
    assert_eq!(calls.matches("--entrypoint /bin/sh alpine:3 -c mktemp").count(), 1);
    assert_eq!(calls.matches("--entrypoint /bin/sh alpine:3 /tmp/fake-step-script").count(), 2);
}

#[tokio::test]
async fn image_without_shell_reports_every_attempt() {
    let harness = Harness::new(&[]);
    let task = task(repository(REPO), vec![step("scratch-image", "true")]);

    let err = harness.run(&task).await.unwrap_err();

    let probe = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ShellProbeError>())
        .expect("shell probe error");
    assert_eq!(probe.image, "scratch-image");
    assert_eq!(probe.attempts.len(), 2);
    assert!(probe.attempts[0].starts_with("/bin/bash: exit status Some(127)"));
    assert!(probe.attempts[1].starts_with("/bin/sh: exit status Some(127)"));
    assert!(probe.attempts[1].contains("not found"));
    assert_eq!(harness.workspaces_left(), 0);
}

#[tokio::test]
async fn failing_step_is_reported_and_cleaned_up() {
    let harness = Harness::new(&["/bin/bash", "/bin/sh"]);
    let task = task(
        repository(REPO),
        vec![step("alpine:3", "echo partial\necho 'no go.mod here' >&2\nexit 3")],
    );

    let err = harness.run(&task).await.unwrap_err();

    assert!(format!("{err:#}").contains(&format!("step 1 in {REPO}")));
    let failed = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<StepFailedError>())
        .expect("step failure");
    assert_eq!(failed.exit_code, Some(3));
    assert_eq!(failed.stdout, "partial\n");
    assert_eq!(failed.stderr, "no go.mod here\n");
    assert!(failed.run_script.ends_with("exit 3"));
    assert!(failed.command.starts_with(&harness.runtime.program()));
    assert!(failed.command.contains("--entrypoint /bin/bash alpine:3"));

    let calls = harness.runtime.calls();
    assert!(calls.contains("rm -f fake-container"));
    assert_eq!(harness.workspaces_left(), 0);
}
