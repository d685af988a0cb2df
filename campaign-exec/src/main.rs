//! `campaign-exec`: run scripted changes across repositories in containers.
//!
//! Reads a JSON task file, executes every step for every repository with
//! bounded parallelism and prints the resulting changeset specs as JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use campaign_exec::core::types::{ChangesetTemplate, Repository, Step};
use campaign_exec::executor::{Executor, ExecutorOptions};
use campaign_exec::exit_codes;
use campaign_exec::io::cache::{DiskCache, ExecutionCache, NoopCache};
use campaign_exec::io::config::{DEFAULT_CONFIG_FILE, ExecutorConfig, load_config};
use campaign_exec::io::context::RunContext;
use campaign_exec::io::docker::Docker;
use campaign_exec::io::fetcher::GitArchiveFetcher;
use campaign_exec::io::step_runner::{DockerTaskRunner, TaskRunner};
use campaign_exec::io::task_log::LogManager;
use campaign_exec::logging;

#[derive(Parser)]
#[command(
    name = "campaign-exec",
    version,
    about = "Run scripted changes across repositories in containers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a task file and print the changeset specs it produces.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON file with `repositories`, `steps` and `changesetTemplate`.
    task_file: PathBuf,

    /// Config file (TOML). Defaults to `campaign-exec.toml` when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of repositories processed at once.
    #[arg(long)]
    parallelism: Option<usize>,

    /// Per-repository timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Discard cached results and re-run every task.
    #[arg(long)]
    clear_cache: bool,

    /// Neither read nor write the cache.
    #[arg(long)]
    skip_cache: bool,

    /// Keep per-task logs of successful tasks.
    #[arg(long)]
    keep_logs: bool,
}

/// Input document of `campaign-exec run`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskFile {
    repositories: Vec<Repository>,
    steps: Vec<Step>,
    changeset_template: ChangesetTemplate,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => cmd_run(args).await,
    };
    std::process::exit(code);
}

async fn cmd_run(args: RunArgs) -> i32 {
    let (cfg, tasks) = match load_inputs(&args) {
        Ok(inputs) => inputs,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };

    let ctx = RunContext::background();
    let interrupt = ctx.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, no further tasks will be started");
            interrupt.cancel();
        }
    });

    let docker = Arc::new(Docker::new(&cfg.container_program).with_output_limit(cfg.output_limit_bytes));
    let fetcher = Arc::new(GitArchiveFetcher::new(&cfg.repos_dir, &cfg.archive_dir));
    let runner = Arc::new(DockerTaskRunner::new(docker, fetcher, cfg.workspace_settings()));
    let cache: Arc<dyn ExecutionCache> = if cfg.skip_cache {
        Arc::new(NoopCache)
    } else {
        Arc::new(DiskCache::new(&cfg.cache_dir))
    };
    let mut executor = Executor::new(
        ExecutorOptions::from_config(&cfg),
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        cache,
        LogManager::new(&cfg.log_dir, cfg.keep_logs),
    );

    let setup = async {
        for repo in tasks.repositories {
            executor.add_task(repo, tasks.steps.clone(), tasks.changeset_template.clone())?;
        }
        runner
            .prepare(&ctx, executor.tasks())
            .await
            .context("prepare step images")?;
        executor.start(&ctx)
    };
    if let Err(err) = setup.await {
        eprintln!("{err:#}");
        return exit_codes::INVALID;
    }

    match executor.wait().await {
        Ok(specs) => {
            let cached = executor
                .locked_task_statuses(|statuses| statuses.iter().filter(|s| s.cached).count());
            info!(specs = specs.len(), cached, "all tasks finished");
            match serde_json::to_string_pretty(&specs) {
                Ok(json) => {
                    println!("{json}");
                    exit_codes::OK
                }
                Err(err) => {
                    eprintln!("serialize changeset specs: {err}");
                    exit_codes::INVALID
                }
            }
        }
        Err(err) => {
            eprintln!("{err}");
            if err.is_timeout() {
                exit_codes::TIMEOUT
            } else {
                exit_codes::TASK_FAILED
            }
        }
    }
}

/// Load config (with CLI overrides applied) and the task file.
fn load_inputs(args: &RunArgs) -> Result<(ExecutorConfig, TaskFile)> {
    let mut cfg = match &args.config {
        Some(path) if !path.exists() => {
            return Err(anyhow!("config file {} does not exist", path.display()));
        }
        Some(path) => load_config(path)?,
        None => load_config(Path::new(DEFAULT_CONFIG_FILE))?,
    };
    if let Some(parallelism) = args.parallelism {
        cfg.parallelism = parallelism;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        cfg.timeout_secs = timeout_secs;
    }
    cfg.clear_cache |= args.clear_cache;
    cfg.skip_cache |= args.skip_cache;
    cfg.keep_logs |= args.keep_logs;
    cfg.validate().context("invalid options")?;

    let raw = fs::read_to_string(&args.task_file)
        .with_context(|| format!("read {}", args.task_file.display()))?;
    let tasks: TaskFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", args.task_file.display()))?;
    if tasks.steps.is_empty() {
        return Err(anyhow!("{} declares no steps", args.task_file.display()));
    }
    Ok((cfg, tasks))
}
