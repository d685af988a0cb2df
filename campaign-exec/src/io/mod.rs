//! Side-effecting operations: processes, containers, git, files.

pub mod cache;
pub mod config;
pub mod context;
pub mod docker;
pub mod fetcher;
pub mod git;
pub mod process;
pub mod step_runner;
pub mod task_log;
pub mod workspace;
