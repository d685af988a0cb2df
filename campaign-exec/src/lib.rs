//! Parallel, cached execution of scripted changes across many repositories.
//!
//! Each repository becomes a task: its steps run in containers against a
//! private Git workspace and the resulting diff becomes a changeset spec.
//!
//! - **[`core`]**: Pure, deterministic logic (data model, templating, cache
//!   keys, status parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, containers, git, cache
//!   files, logs). Isolated behind traits so tests can swap in fakes.
//!
//! [`executor`] ties the two together: it schedules tasks, consults the cache
//! and tracks per-task status.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
